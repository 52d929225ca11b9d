#![allow(dead_code)]

pub mod harness;
pub mod server;
pub mod vectors;
