pub mod llm_client;
pub mod ocr_client;

pub use llm_client::{LanguageModel, OpenAiLanguageModel};
pub use ocr_client::{HttpOcrClient, OcrProvider, Preprocessor};
