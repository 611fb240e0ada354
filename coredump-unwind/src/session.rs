use std::ops::{Deref, DerefMut};

use crate::UnwindEngine;

/// Owns an engine handle and guarantees teardown on every exit path,
/// including panics and early `?` returns.
///
/// Using the engine after teardown is a fatal usage error in the foreign
/// wrapper; routing all access through this guard makes that state
/// unrepresentable, since dropping the session consumes the handle.
pub struct EngineSession<E: UnwindEngine> {
    engine: E,
}

impl<E: UnwindEngine> EngineSession<E> {
    pub fn new(engine: E) -> EngineSession<E> {
        EngineSession { engine }
    }
}

impl<E: UnwindEngine> Deref for EngineSession<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.engine
    }
}

impl<E: UnwindEngine> DerefMut for EngineSession<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

impl<E: UnwindEngine> Drop for EngineSession<E> {
    fn drop(&mut self) {
        tracing::debug!("destroying unwind engine context");
        self.engine.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cursor, EngineError, SignalInfo};
    use coredump_common::AuxvTag;
    use std::path::Path;
    use std::rc::Rc;
    use std::cell::Cell;

    struct CountingEngine {
        ended: Rc<Cell<u32>>,
    }

    impl UnwindEngine for CountingEngine {
        fn thread_count(&mut self) -> u32 {
            0
        }
        fn select_thread(&mut self, _index: u32) -> Result<(), EngineError> {
            Ok(())
        }
        fn cursor(&mut self) -> Cursor {
            Cursor::default()
        }
        fn step(&mut self) -> bool {
            true
        }
        fn auxv_value(&mut self, _tag: AuxvTag) -> u64 {
            0
        }
        fn auxv_string(&mut self, _tag: AuxvTag) -> String {
            String::new()
        }
        fn signal_info(&mut self, _thread: u32) -> Option<SignalInfo> {
            None
        }
        fn register_backing_file(&mut self, _path: &Path, _address: u64) {}
        fn executable_path(&mut self) -> Option<String> {
            None
        }
        fn executable_args(&mut self) -> Option<String> {
            None
        }
        fn is_64_bit(&mut self) -> Option<bool> {
            None
        }
        fn end(&mut self) {
            self.ended.set(self.ended.get() + 1);
        }
    }

    #[test]
    fn test_session_ends_engine_once_on_drop() {
        let ended = Rc::new(Cell::new(0));
        {
            let _session = EngineSession::new(CountingEngine {
                ended: ended.clone(),
            });
        }
        assert_eq!(ended.get(), 1);
    }

    #[test]
    fn test_session_ends_engine_on_panic() {
        let ended = Rc::new(Cell::new(0));
        let ended2 = ended.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _session = EngineSession::new(CountingEngine { ended: ended2 });
            panic!("walker blew up");
        }));
        assert!(result.is_err());
        assert_eq!(ended.get(), 1);
    }
}
