// src/vector.rs
// Vector math for similarity retrieval, plus the embedding byte codec

use crate::error::{HivemindError, Result};

fn check_dimensions(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(HivemindError::InvalidArgument(format!(
            "vector dimensions don't match: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(())
}

/// Cosine similarity normalized from [-1,1] to [0,1].
///
/// A zero-magnitude operand yields 0.0 rather than dividing by zero, so the
/// zero vector is maximally dissimilar to everything including itself.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dimensions(a, b)?;

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = magnitude(a);
    let mag_b = magnitude(b);

    if mag_a == 0.0 || mag_b == 0.0 {
        return Ok(0.0);
    }

    let similarity = dot / (mag_a * mag_b);
    Ok((similarity + 1.0) / 2.0)
}

/// Euclidean (L2) distance between two vectors
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dimensions(a, b)?;
    Ok(a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt())
}

/// Manhattan (L1) distance between two vectors
pub fn manhattan_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dimensions(a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum())
}

/// Dot product of two vectors
pub fn dot_product(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dimensions(a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| x * y).sum())
}

/// Magnitude (L2 norm) of a vector
pub fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalize a vector to unit length. The zero vector is returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let mag = magnitude(v);
    if mag == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / mag).collect()
}

/// Find the `top_k` vectors most similar to `query`.
///
/// Returns `(index, normalized_cosine)` pairs sorted by similarity
/// descending. Candidates with a mismatched dimension are an error.
pub fn find_similar(query: &[f32], vectors: &[Vec<f32>], top_k: usize) -> Result<Vec<(usize, f32)>> {
    let mut scored = Vec::with_capacity(vectors.len());
    for (i, v) in vectors.iter().enumerate() {
        scored.push((i, cosine_similarity(query, v)?));
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    Ok(scored)
}

/// Pack an embedding as little-endian f32 bytes for BLOB storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Unpack a little-endian f32 BLOB back into an embedding.
///
/// The byte length must be a multiple of 4; anything else means the row was
/// written by something other than `embedding_to_bytes`.
pub fn bytes_to_embedding(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % 4 != 0 {
        return Err(HivemindError::InvalidArgument(format!(
            "embedding blob length {} is not a multiple of 4",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let score = cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_antiparallel() {
        let score = cosine_similarity(&[1.0, 0.0, 0.0], &[-1.0, 0.0, 0.0]).unwrap();
        assert!(score.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let score = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]).unwrap();
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        let score = cosine_similarity(&[0.0, 0.0, 0.0], &[1.0, 0.0, 0.0]).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        let err = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::HivemindError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_euclidean_and_manhattan() {
        let d = euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap();
        assert!((d - 5.0).abs() < 1e-6);

        let m = manhattan_distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap();
        assert!((m - 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize() {
        let n = normalize(&[3.0, 4.0]);
        assert!((magnitude(&n) - 1.0).abs() < 1e-6);

        // Zero vector passes through untouched
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_find_similar_ordering() {
        let query = vec![1.0, 0.0];
        let vectors = vec![
            vec![0.0, 1.0],  // orthogonal
            vec![1.0, 0.0],  // identical
            vec![0.9, 0.1],  // close
        ];

        let top = find_similar(&query, &vectors, 2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, 1);
        assert_eq!(top[1].0, 2);
        assert!(top[0].1 > top[1].1);
    }

    #[test]
    fn test_embedding_codec_bit_exact() {
        let original = vec![0.1_f32, -2.5, 1536.0, f32::MIN_POSITIVE, 0.0, -0.0];
        let bytes = embedding_to_bytes(&original);
        assert_eq!(bytes.len(), original.len() * 4);

        let decoded = bytes_to_embedding(&bytes).unwrap();
        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.iter().zip(&decoded) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_embedding_codec_rejects_ragged_blob() {
        assert!(bytes_to_embedding(&[0u8, 1, 2]).is_err());
    }
}
