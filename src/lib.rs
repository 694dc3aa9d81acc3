// src/lib.rs

// Import the top-level `flowllm` module.
pub mod flowllm;

// Re-export the modules at the crate root so callers write
// `flowllm::engine::FlowEngine` instead of navigating the hierarchy.
pub use flowllm::{
    agent_runner, approval, clients, condition, dispatcher, engine, error, gateway, model,
    orchestrator, scheduler, schema, store, template,
};

// Re-exporting key items for easier external access.
pub use flowllm::engine::FlowEngine;
pub use flowllm::error::EngineError;
pub use flowllm::gateway::{GatewayRouter, LlmGateway};
pub use flowllm::store::Store;
