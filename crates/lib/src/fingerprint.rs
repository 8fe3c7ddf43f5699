//! Content-addressed cache keys.
//!
//! A fingerprint identifies a `(PDF bytes, label, schema)` triple. The
//! schema contributes its canonical form, so reordering schema keys does
//! not change the key.

use crate::types::Schema;
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_128;

/// A 128-bit fingerprint over one extraction request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(u128);

impl Fingerprint {
    pub fn compute(pdf_bytes: &[u8], label: &str, schema: &Schema) -> Self {
        let canonical = schema.canonical_json();
        let mut buf = Vec::with_capacity(16 + label.len() + 1 + canonical.len());
        buf.extend_from_slice(&xxh3_128(pdf_bytes).to_le_bytes());
        buf.extend_from_slice(label.as_bytes());
        buf.push(0);
        buf.extend_from_slice(canonical.as_bytes());
        Fingerprint(xxh3_128(&buf))
    }

    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:032x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(pairs: &[(&str, &str)]) -> Schema {
        Schema::from_pairs(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn identical_inputs_yield_identical_keys() {
        let s = schema(&[("nome", "Nome"), ("cpf", "CPF do titular")]);
        let a = Fingerprint::compute(b"%PDF-1.4 doc", "oab", &s);
        let b = Fingerprint::compute(b"%PDF-1.4 doc", "oab", &s);
        assert_eq!(a, b);
    }

    #[test]
    fn schema_order_does_not_change_the_key() {
        let a = Fingerprint::compute(
            b"%PDF-1.4 doc",
            "oab",
            &schema(&[("nome", "Nome"), ("cpf", "CPF do titular")]),
        );
        let b = Fingerprint::compute(
            b"%PDF-1.4 doc",
            "oab",
            &schema(&[("cpf", "CPF do titular"), ("nome", "Nome")]),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn label_and_bytes_both_contribute() {
        let s = schema(&[("nome", "Nome")]);
        let base = Fingerprint::compute(b"%PDF-1.4 doc", "oab", &s);
        assert_ne!(base, Fingerprint::compute(b"%PDF-1.4 doc", "tela", &s));
        assert_ne!(base, Fingerprint::compute(b"%PDF-1.4 other", "oab", &s));
    }

    #[test]
    fn hex_is_stable_and_32_chars() {
        let s = schema(&[("nome", "Nome")]);
        let fp = Fingerprint::compute(b"%PDF-1.4 doc", "oab", &s);
        assert_eq!(fp.to_hex().len(), 32);
        assert_eq!(fp.to_hex(), fp.to_string());
    }
}
