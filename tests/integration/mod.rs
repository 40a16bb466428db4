//! Integration test modules.

mod acquisition_test;
mod support;
mod supervisor_test;
