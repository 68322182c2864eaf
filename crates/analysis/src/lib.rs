pub mod analyzer;
pub mod evidence;
pub mod llm;
pub mod repro;
pub mod sandbox;
