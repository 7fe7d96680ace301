//! Sequential tools that produce or consume the same data + index pair as
//! the apply engine.
//!
//! | Tool | Reads | Writes |
//! |------|-------|--------|
//! | [`build`]   | multi-record text (FASTA) | data + index |
//! | [`get`]     | data + index              | record bytes, or data + index |
//! | [`reindex`] | data                      | index |
//! | [`rename`]  | data + index              | index |

pub mod build;
pub mod get;
pub mod reindex;
pub mod rename;
