// src/flowllm/clients/mod.rs

pub mod http;
