//! # Concat Recipes
//!
//! A recipe is an optional sibling of a blob describing how to reconstruct
//! it by concatenating byte ranges of other blobs. Recipes exist to claw
//! back space when a large blob is later discovered to be a concatenation of
//! pieces the repository already stores.
//!
//! Only first-level recipes are allowed: every piece source must resolve to
//! a raw blob, never to another recipe. That depth limit is enforced where
//! pieces are resolved, not here — this module owns the descriptor and its
//! structural invariants.

use crate::error::{RepoError, Result};
use serde::{Deserialize, Serialize};

/// Reconstruction methods. `concat` is the only one defined by the format.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecipeMethod {
    Concat,
}

/// One contiguous byte range contributed by a source blob.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RecipePiece {
    /// Checksum of the raw blob the bytes come from.
    pub source: String,

    /// Offset of this piece within the *reconstructed* blob.
    pub offset: u64,

    /// Number of bytes contributed.
    pub length: u64,
}

/// A deferred-concatenation description producing a blob from other blobs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub method: RecipeMethod,

    /// Checksum of the reconstructed blob; equals the recipe file's stem.
    pub md5sum: String,

    /// Total size of the reconstructed blob in bytes.
    pub size: u64,

    /// Ordered pieces whose concatenation yields the blob.
    pub pieces: Vec<RecipePiece>,
}

impl Recipe {
    /// Checks the structural invariants: piece offsets are contiguous
    /// starting at 0 and the lengths sum to `size`.
    pub fn validate(&self) -> Result<()> {
        let mut expected_offset = 0u64;
        for piece in &self.pieces {
            if piece.offset != expected_offset {
                return Err(RepoError::RecipeInvalid {
                    hash: self.md5sum.clone(),
                    message: format!(
                        "piece from {} at offset {} should start at {expected_offset}",
                        piece.source, piece.offset
                    ),
                }
                .into());
            }
            expected_offset += piece.length;
        }
        if expected_offset != self.size {
            return Err(RepoError::RecipeInvalid {
                hash: self.md5sum.clone(),
                message: format!("piece lengths sum to {expected_offset}, size says {}", self.size),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(source: &str, offset: u64, length: u64) -> RecipePiece {
        RecipePiece {
            source: source.to_string(),
            offset,
            length,
        }
    }

    #[test]
    fn contiguous_recipe_validates() {
        let recipe = Recipe {
            method: RecipeMethod::Concat,
            md5sum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size: 10,
            pieces: vec![piece("aa", 0, 4), piece("bb", 4, 6)],
        };
        recipe.validate().unwrap();
    }

    #[test]
    fn gap_is_rejected() {
        let recipe = Recipe {
            method: RecipeMethod::Concat,
            md5sum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size: 10,
            pieces: vec![piece("aa", 0, 4), piece("bb", 5, 5)],
        };
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let recipe = Recipe {
            method: RecipeMethod::Concat,
            md5sum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size: 11,
            pieces: vec![piece("aa", 0, 4), piece("bb", 4, 6)],
        };
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn unknown_method_fails_to_parse() {
        let json = r#"{"method": "xor", "md5sum": "00", "size": 0, "pieces": []}"#;
        assert!(serde_json::from_str::<Recipe>(json).is_err());
    }

    #[test]
    fn descriptor_round_trips() {
        let recipe = Recipe {
            method: RecipeMethod::Concat,
            md5sum: "9e107d9d372bb6826bd81d3542a419d6".to_string(),
            size: 43,
            pieces: vec![piece("0cc175b9c0f1b6a831c399e269772661", 0, 43)],
        };
        let json = serde_json::to_string(&recipe).unwrap();
        assert!(json.contains("\"concat\""));
        let back: Recipe = serde_json::from_str(&json).unwrap();
        assert_eq!(back, recipe);
    }
}
