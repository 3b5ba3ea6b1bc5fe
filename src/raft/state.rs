use super::Index;
use crate::error::Result;

/// A state machine fed by the apply loop. Committed entries are delivered in
/// strict index order, exactly once per process lifetime; noop entries are
/// skipped. The apply loop calls this without any consensus locks held.
pub trait State: Send {
    /// Applies a committed command. An error means the command was refused;
    /// it is logged, not retried, and surfaced to the waiting client.
    fn apply(&mut self, index: Index, command: Vec<u8>) -> Result<Vec<u8>>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// A state machine that records applied commands in a shared vector,
    /// visible to the test through clones of the handle.
    #[derive(Clone)]
    pub struct TestState {
        commands: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl TestState {
        pub fn new() -> Self {
            Self { commands: Arc::new(Mutex::new(Vec::new())) }
        }

        pub fn list(&self) -> Vec<Vec<u8>> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl State for TestState {
        fn apply(&mut self, _index: Index, command: Vec<u8>) -> Result<Vec<u8>> {
            self.commands.lock().unwrap().push(command.clone());
            Ok(command)
        }
    }
}
