#[path = "../support/mod.rs"]
mod support;

mod end_to_end;
mod runner;
