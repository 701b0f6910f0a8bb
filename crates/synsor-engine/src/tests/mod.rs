pub mod common;

mod config_roundtrip;
mod cycles;
