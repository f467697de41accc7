//! Integration tests for the classcloak workspace.
#![cfg(test)]

mod fixtures;

mod core {
    mod decoder;
    mod encoder;
}

mod transforms {
    mod control_flow;
    mod literals;
    mod pipeline;
}
