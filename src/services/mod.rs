pub mod extractor;
pub mod resilient_store;

pub use extractor::{ExtractionInput, ExtractionOutcome, Extractor};
pub use resilient_store::{ResilientStore, WriteReport, WriteState};
