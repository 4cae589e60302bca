// src/identity.rs
// Device identity and capability detection

use std::net::UdpSocket;
use std::process::Command;
use tracing::{debug, info};

use crate::types::{DeviceContext, HardwareTier};

/// Handles device detection and registration data
pub struct DeviceIdentity;

impl DeviceIdentity {
    /// Generate a stable device id: `hostname + "_" + mac48-hex-colons`.
    ///
    /// Falls back to `hostname + "_" + 8-hex-random` when no usable MAC is
    /// found, so the id is still unique but not stable across restarts.
    pub fn generate_device_id(hostname: Option<&str>) -> String {
        let hostname = hostname
            .map(str::to_string)
            .unwrap_or_else(Self::get_hostname);

        match Self::primary_mac_address() {
            Some(mac) => format!("{hostname}_{mac}"),
            None => format!("{hostname}_{:08x}", rand::random::<u32>()),
        }
    }

    /// Get system hostname
    pub fn get_hostname() -> String {
        let name = gethostname::gethostname().to_string_lossy().to_string();
        if name.is_empty() {
            "unknown".to_string()
        } else {
            name
        }
    }

    /// MAC of the first non-loopback interface, lowercase hex with colons.
    fn primary_mac_address() -> Option<String> {
        let entries = std::fs::read_dir("/sys/class/net").ok()?;

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name != "lo")
            .collect();
        names.sort();

        for name in names {
            if let Ok(raw) = std::fs::read_to_string(format!("/sys/class/net/{name}/address")) {
                let mac = raw.trim().to_lowercase();
                if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                    debug!(interface = %name, mac = %mac, "Using interface for device id");
                    return Some(mac);
                }
            }
        }
        None
    }

    /// Auto-detect hardware tier from total memory and core count.
    ///
    /// When host probing is unavailable the answer is `laptop`.
    pub fn detect_hardware_tier() -> HardwareTier {
        let Some((memory_bytes, cores)) = Self::probe_host() else {
            return HardwareTier::Laptop;
        };

        let memory_gib = memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        if memory_gib >= 32.0 && cores >= 8 {
            HardwareTier::Server
        } else if memory_gib >= 16.0 && cores >= 4 {
            HardwareTier::Workstation
        } else if memory_gib >= 8.0 && cores >= 2 {
            HardwareTier::Laptop
        } else {
            HardwareTier::RaspberryPi
        }
    }

    /// Auto-detect coarse capability tags.
    pub fn detect_capabilities() -> Vec<String> {
        let mut capabilities = Vec::new();

        match Self::probe_host() {
            Some((memory_bytes, cores)) => {
                let memory_gib = memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
                if memory_gib >= 16.0 {
                    capabilities.push("high_memory".to_string());
                } else if memory_gib >= 8.0 {
                    capabilities.push("medium_memory".to_string());
                } else {
                    capabilities.push("low_memory".to_string());
                }

                if cores >= 8 {
                    capabilities.push("multi_core".to_string());
                } else if cores >= 4 {
                    capabilities.push("quad_core".to_string());
                } else {
                    capabilities.push("low_core".to_string());
                }
            }
            None => {
                capabilities.push("unknown_memory".to_string());
                capabilities.push("unknown_cpu".to_string());
            }
        }

        if Self::has_nvidia_gpu() {
            capabilities.push("gpu".to_string());
            capabilities.push("cuda".to_string());
        }

        // Every fleet member is assumed reachable
        capabilities.push("network".to_string());

        capabilities
    }

    /// (total memory bytes, core count), or None when probing fails.
    fn probe_host() -> Option<(u64, usize)> {
        use sysinfo::System;

        let mut sys = System::new();
        sys.refresh_memory();
        let memory = sys.total_memory();
        if memory == 0 {
            return None;
        }

        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Some((memory, cores))
    }

    fn has_nvidia_gpu() -> bool {
        if std::path::Path::new("/dev/nvidia0").exists() {
            return true;
        }
        Command::new("nvidia-smi")
            .arg("-L")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Best-effort local IP via the UDP-connect trick. No packets are sent;
    /// connecting just forces the OS to pick a route and source address.
    pub fn get_ip_address() -> Option<String> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        Some(socket.local_addr().ok()?.ip().to_string())
    }

    /// Compose a device context with auto-detection, honoring overrides.
    pub fn create_device_context(
        device_id: Option<&str>,
        device_name: Option<&str>,
        location: &str,
    ) -> DeviceContext {
        let hostname = device_name
            .map(str::to_string)
            .unwrap_or_else(Self::get_hostname);
        let device_id = device_id
            .map(str::to_string)
            .unwrap_or_else(|| Self::generate_device_id(Some(&hostname)));

        let tier = Self::detect_hardware_tier();
        info!(device_id = %device_id, tier = %tier, "Detected device context");

        let mut context = DeviceContext::new(device_id, tier);
        context.capabilities = Self::detect_capabilities();
        context.location = location.to_string();
        context.hostname = Some(hostname);
        context.ip_address = Self::get_ip_address();
        context
    }
}
