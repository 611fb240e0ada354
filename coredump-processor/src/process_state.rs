//! The result artifact of one reconstruction.

use serde::{Deserialize, Serialize};

use coredump_common::{CallStack, FaultContext, Module, SystemContext};

use crate::fingerprint::CrashFingerprint;

/// An exception recorded in the dump, if the crashed runtime produced one.
///
/// Native Linux dumps usually carry none; the field exists so managed-runtime
/// dumps keep their exception through fingerprinting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
}

/// Everything the pipeline reconstructed from one core dump.
///
/// Serializes to the JSON artifact consumed by the service layer; a previous
/// run's artifact also parses back into this type so symbolication can be
/// re-run without re-unwinding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessState {
    pub system_context: SystemContext,
    pub modules: Vec<Module>,
    pub threads: Vec<CallStack>,
    #[serde(default)]
    pub fault_context: Option<FaultContext>,
    #[serde(default)]
    pub exception: Option<ExceptionInfo>,
    /// Stable hashes for crash deduplication, stamped with the schema
    /// version they were computed under.
    #[serde(default)]
    pub fingerprint: Option<CrashFingerprint>,
}

impl ProcessState {
    /// The thread the terminating signal hit, if one was identified.
    pub fn faulting_thread(&self) -> Option<&CallStack> {
        let fault = self.fault_context.as_ref()?;
        self.threads.get(fault.thread_index as usize)
    }

    pub fn from_json(json: &str) -> Result<ProcessState, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self, pretty: bool) -> Result<String, serde_json::Error> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coredump_common::StackFrame;

    fn sample_state() -> ProcessState {
        let mut thread = CallStack::with_index(0);
        thread
            .frames
            .push(StackFrame::new("main".into(), 0x10, 0x1000, 0x7f00, 0x2000));
        ProcessState {
            threads: vec![thread],
            modules: vec![Module::new("/bin/app", 0x400000, 0x500000, 0)],
            fault_context: Some(FaultContext {
                thread_index: 0,
                signal_number: 11,
                signal_name: "SIGSEGV".into(),
                fault_address: Some(0x10),
                error_number: None,
                description: "SIGSEGV: Invalid memory reference to address 0x10".into(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_json_round_trip() {
        let state = sample_state();
        let json = state.to_json(true).unwrap();
        let parsed = ProcessState::from_json(&json).unwrap();
        assert_eq!(parsed.threads.len(), 1);
        assert_eq!(parsed.threads[0].frames[0].method_name, "main");
        assert_eq!(parsed.modules[0].name, "app");
        assert_eq!(parsed.fault_context.unwrap().signal_name, "SIGSEGV");
    }

    #[test]
    fn test_faulting_thread_lookup() {
        let state = sample_state();
        assert_eq!(state.faulting_thread().unwrap().index, 0);

        let mut no_fault = sample_state();
        no_fault.fault_context = None;
        assert!(no_fault.faulting_thread().is_none());
    }
}
