pub mod lora;

pub use lora::{LoraAdapter, LoraCollection};
