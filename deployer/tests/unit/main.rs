//! Unit tests

mod test_fsm;
mod test_version;
