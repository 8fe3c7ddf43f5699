pub mod pdf_text;

use crate::errors::ExtractError;
use crate::types::ParsedDocument;
use async_trait::async_trait;
use dyn_clone::DynClone;
use std::fmt::Debug;

/// A trait for turning raw PDF bytes into positioned text elements.
///
/// The coordinate convention is the implementation's own; it must tag the
/// returned document with a stable `coord_space` string so positional
/// patterns learned with one parser are never applied to another's
/// output.
#[async_trait]
pub trait DocumentParser: Send + Sync + Debug + DynClone {
    async fn parse(&self, pdf_bytes: &[u8]) -> Result<ParsedDocument, ExtractError>;
}

dyn_clone::clone_trait_object!(DocumentParser);
