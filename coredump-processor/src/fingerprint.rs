//! Crash fingerprints and pairwise similarity.
//!
//! A fingerprint reduces one reconstruction to small sets of stable string
//! hashes, so the service layer can bucket recurring crashes without
//! re-reading full artifacts. Hashing is FNV-1a over a normalized form of
//! each string; normalization keeps only alphanumeric characters,
//! lowercased, so cosmetic differences in symbol rendering do not split
//! buckets.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::process_state::ProcessState;

/// Bump when the hashing or normalization rules change; stored fingerprints
/// with an older version are recomputed instead of compared.
pub const FINGERPRINT_SCHEMA_VERSION: u32 = 1;

fn fnv1a(text: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in text.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Stable hash of one symbol or message.
pub fn stable_hash(text: &str) -> u32 {
    fnv1a(&normalize(text))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashFingerprint {
    pub schema_version: u32,
    /// Distinct method-name hashes from the faulting thread's frames.
    pub frame_hashes: BTreeSet<u32>,
    /// Distinct module-name hashes from the faulting thread's frames.
    pub module_hashes: BTreeSet<u32>,
    #[serde(default)]
    pub last_event_type_hash: Option<u32>,
    #[serde(default)]
    pub last_event_description_hash: Option<u32>,
    #[serde(default)]
    pub exception_type_hash: Option<u32>,
    #[serde(default)]
    pub exception_message_hash: Option<u32>,
}

impl CrashFingerprint {
    pub fn is_current(&self) -> bool {
        self.schema_version == FINGERPRINT_SCHEMA_VERSION
    }
}

/// Computes the fingerprint of one reconstruction.
///
/// Only the faulting thread contributes stack and module hashes; the other
/// threads are usually parked in identical wait loops and would drown out
/// the signal. Debugger break events describe the act of taking the dump,
/// not the crash, and are not fingerprinted.
pub fn fingerprint(state: &ProcessState) -> CrashFingerprint {
    let mut print = CrashFingerprint {
        schema_version: FINGERPRINT_SCHEMA_VERSION,
        ..Default::default()
    };
    if let Some(thread) = state.faulting_thread() {
        for frame in &thread.frames {
            if !frame.method_name.is_empty() {
                print.frame_hashes.insert(stable_hash(&frame.method_name));
            }
            if !frame.module_name.is_empty() {
                print.module_hashes.insert(stable_hash(&frame.module_name));
            }
        }
    }
    if let Some(fault) = &state.fault_context {
        if !fault.description.starts_with("Break instruction exception") {
            print.last_event_type_hash = Some(stable_hash(&fault.signal_number.to_string()));
            print.last_event_description_hash = Some(stable_hash(&fault.description));
        }
    }
    if let Some(exception) = &state.exception {
        print.exception_type_hash = Some(stable_hash(&exception.type_name));
        print.exception_message_hash = Some(stable_hash(&exception.message));
    }
    print
}

/// The four per-dimension scores of one comparison.
///
/// A dimension is `None` when neither crash carries the data, so a missing
/// feature never counts for or against a match. A dimension one side has
/// and the other lacks scores 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityScore {
    pub stack: Option<f64>,
    pub modules: Option<f64>,
    pub last_event: Option<f64>,
    pub exception: Option<f64>,
}

impl SimilarityScore {
    /// Mean of the dimensions that apply, 0 if none do.
    pub fn overall(&self) -> f64 {
        let present: Vec<f64> = [self.stack, self.modules, self.last_event, self.exception]
            .into_iter()
            .flatten()
            .collect();
        if present.is_empty() {
            0.0
        } else {
            present.iter().sum::<f64>() / present.len() as f64
        }
    }
}

/// Compares two fingerprints. Symmetric in its arguments.
pub fn similarity(a: &CrashFingerprint, b: &CrashFingerprint) -> SimilarityScore {
    SimilarityScore {
        stack: set_overlap(&a.frame_hashes, &b.frame_hashes),
        modules: set_overlap(&a.module_hashes, &b.module_hashes),
        last_event: event_match(
            a.last_event_type_hash.zip(a.last_event_description_hash),
            b.last_event_type_hash.zip(b.last_event_description_hash),
        ),
        exception: event_match(
            a.exception_type_hash.zip(a.exception_message_hash),
            b.exception_type_hash.zip(b.exception_message_hash),
        ),
    }
}

/// Overlap of two hash sets, scored against the larger set so a stack that
/// is a strict subset of another still scores below 1.
fn set_overlap(a: &BTreeSet<u32>, b: &BTreeSet<u32>) -> Option<f64> {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => None,
        (true, false) | (false, true) => Some(0.0),
        (false, false) => {
            let shared = a.intersection(b).count() as f64;
            Some((shared / a.len() as f64).min(shared / b.len() as f64))
        }
    }
}

fn event_match(a: Option<(u32, u32)>, b: Option<(u32, u32)>) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        (Some(a), Some(b)) => Some(if a == b { 1.0 } else { 0.0 }),
        _ => Some(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_state::ExceptionInfo;
    use coredump_common::{CallStack, FaultContext, StackFrame};

    fn state_with_stack(methods: &[&str]) -> ProcessState {
        let mut thread = CallStack::with_index(0);
        for (i, method) in methods.iter().enumerate() {
            let mut frame =
                StackFrame::new(method.to_string(), 0, 0x1000 + i as u64, 0x7f00, 0);
            frame.module_name = "libapp.so".to_string();
            thread.frames.push(frame);
        }
        ProcessState {
            threads: vec![thread],
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
    fn test_normalization_ignores_case_and_punctuation() {
        assert_eq!(stable_hash("Json::Parser::parse"), stable_hash("jsonparserparse"));
        assert_ne!(stable_hash("parse"), stable_hash("parse2"));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let state = state_with_stack(&["main", "run", "crash"]);
        assert_eq!(fingerprint(&state), fingerprint(&state));
    }

    #[test]
    fn test_identical_crashes_score_one() {
        let print = fingerprint(&state_with_stack(&["main", "run", "crash"]));
        let score = similarity(&print, &print);
        assert_eq!(score.stack, Some(1.0));
        assert_eq!(score.modules, Some(1.0));
        assert_eq!(score.last_event, Some(1.0));
        assert_eq!(score.exception, None);
        assert_eq!(score.overall(), 1.0);
    }

    #[test]
    fn test_subset_stack_scores_against_larger_stack() {
        let seven = fingerprint(&state_with_stack(&[
            "f0", "f1", "f2", "f3", "f4", "f5", "f6",
        ]));
        let eight = fingerprint(&state_with_stack(&[
            "f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7",
        ]));
        let score = similarity(&seven, &eight);
        assert_eq!(score.stack, Some(0.875));
        assert_eq!(score.stack, similarity(&eight, &seven).stack);
    }

    #[test]
    fn test_missing_stack_on_one_side_scores_zero() {
        let with_stack = fingerprint(&state_with_stack(&["main"]));
        let mut no_fault = state_with_stack(&["main"]);
        no_fault.fault_context = None;
        let without_stack = fingerprint(&no_fault);
        assert_eq!(similarity(&with_stack, &without_stack).stack, Some(0.0));
        assert_eq!(similarity(&without_stack, &without_stack).stack, None);
    }

    #[test]
    fn test_break_event_is_not_fingerprinted() {
        let mut state = state_with_stack(&["main"]);
        state.fault_context.as_mut().unwrap().description =
            "Break instruction exception while dumping".into();
        let print = fingerprint(&state);
        assert_eq!(print.last_event_type_hash, None);
        assert_eq!(print.last_event_description_hash, None);
        // The thread is still the faulting thread; its stack stays in.
        assert!(!print.frame_hashes.is_empty());
    }

    #[test]
    fn test_exception_dimension() {
        let mut a = state_with_stack(&["main"]);
        a.exception = Some(ExceptionInfo {
            type_name: "System.NullReferenceException".into(),
            message: "Object reference not set".into(),
        });
        let mut b = a.clone();
        let print_a = fingerprint(&a);
        assert_eq!(similarity(&print_a, &fingerprint(&b)).exception, Some(1.0));
        b.exception.as_mut().unwrap().message = "different".into();
        assert_eq!(similarity(&print_a, &fingerprint(&b)).exception, Some(0.0));
        b.exception = None;
        assert_eq!(similarity(&print_a, &fingerprint(&b)).exception, Some(0.0));
    }

    #[test]
    fn test_different_signals_differ_in_last_event() {
        let a = fingerprint(&state_with_stack(&["main"]));
        let mut other = state_with_stack(&["main"]);
        {
            let fault = other.fault_context.as_mut().unwrap();
            fault.signal_number = 6;
            fault.description = "SIGABRT: Process abort signal".into();
        }
        let b = fingerprint(&other);
        assert_eq!(similarity(&a, &b).last_event, Some(0.0));
        assert_eq!(similarity(&a, &b).stack, Some(1.0));
    }
}
