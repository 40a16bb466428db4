//! Unit test modules.

mod decoder_test;
mod profile_test;
mod router_test;
