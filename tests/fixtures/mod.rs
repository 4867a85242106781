#![allow(dead_code)]

mod fake_oracle;
mod fake_runtime;
mod harness;

pub use fake_oracle::{FakeOracle, Scenario};
pub use fake_runtime::FakeRuntime;
pub use harness::{wait_for, Harness};
