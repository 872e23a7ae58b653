//! The mutation broker: a stage-keyed indirection wrapped around every
//! descriptor serializer and class response in the crate.
//!
//! A producer is tagged with a stable stage name. Before the producer runs,
//! the broker asks the attached fuzzer (if any) for a mutation keyed by the
//! stage name and the producer's session data; a returned mutation is used
//! verbatim and the producer is never called. Without a fuzzer, or when the
//! fuzzer has no mutation for the stage, the deterministic producer runs.
//! This indirection is the only way fuzzing perturbs the protocol engine.

pub mod client;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::Result;

/// Named byte strings a producer exposes to the fuzzer alongside the stage
/// name (e.g. the opcode and transaction id of the current SCSI command).
pub type SessionData = BTreeMap<String, Vec<u8>>;

/// A source of mutations, keyed by stage name. Implemented by the remote
/// RPC client and by test stubs.
pub trait MutationSource: Send + Sync {
    fn get_mutation(&self, stage: &str, data: &SessionData) -> Option<Vec<u8>>;
}

/// Records every stage as it is emitted, one name per line. The resulting
/// file is the input to external corpus replay.
pub struct StageLogger {
    out: Mutex<BufWriter<File>>,
}

impl StageLogger {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    fn log(&self, stage: &str) {
        let mut out = self.out.lock().unwrap();
        if writeln!(out, "{stage}").and_then(|_| out.flush()).is_err() {
            log::warn!("failed to write stage log entry for {stage}");
        }
    }
}

/// Wraps descriptor serializers and class responses with the fuzzer
/// indirection. Shared across the device graph and worker threads.
#[derive(Default)]
pub struct MutationBroker {
    source: Option<Box<dyn MutationSource>>,
    stages: Option<StageLogger>,
}

impl MutationBroker {
    /// A broker with no fuzzer attached: every producer call falls through
    /// to its deterministic serializer.
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn with_source(source: Box<dyn MutationSource>) -> Self {
        Self {
            source: Some(source),
            stages: None,
        }
    }

    /// Install a stage logger; subsequent producer calls append their stage
    /// name to it.
    pub fn set_stage_logger(&mut self, logger: StageLogger) {
        self.stages = Some(logger);
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Run a producer that may itself decline to answer (class handlers).
    /// A mutation substitutes the producer entirely.
    pub fn wrap<F>(&self, stage: &str, session: &SessionData, producer: F) -> Option<Vec<u8>>
    where
        F: FnOnce() -> Option<Vec<u8>>,
    {
        if let Some(logger) = &self.stages {
            logger.log(stage);
        }
        if let Some(source) = &self.source {
            if let Some(mutation) = source.get_mutation(stage, session) {
                log::info!("got mutation for stage {stage} ({} bytes)", mutation.len());
                return Some(mutation);
            }
        }
        log::debug!("stage {stage}: using deterministic producer");
        producer()
    }

    /// Run a producer that always yields bytes (descriptor serializers).
    pub fn produce<F>(&self, stage: &str, session: &SessionData, producer: F) -> Vec<u8>
    where
        F: FnOnce() -> Vec<u8>,
    {
        self.wrap(stage, session, || Some(producer()))
            .unwrap_or_default()
    }

    /// Convenience for producers with no session data.
    pub fn produce_plain<F>(&self, stage: &str, producer: F) -> Vec<u8>
    where
        F: FnOnce() -> Vec<u8>,
    {
        self.produce(stage, &SessionData::new(), producer)
    }
}

/// A fixed stage -> bytes table; handy as a fuzzer stand-in for tests.
pub struct StaticMutations(pub BTreeMap<String, Vec<u8>>);

impl MutationSource for StaticMutations {
    fn get_mutation(&self, stage: &str, _data: &SessionData) -> Option<Vec<u8>> {
        self.0.get(stage).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(stage: &str, bytes: &[u8]) -> MutationBroker {
        let mut map = BTreeMap::new();
        map.insert(stage.to_string(), bytes.to_vec());
        MutationBroker::with_source(Box::new(StaticMutations(map)))
    }

    #[test]
    fn passthrough_calls_producer() {
        let broker = MutationBroker::passthrough();
        let out = broker.produce_plain("device_descriptor", || vec![1, 2, 3]);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn mutation_replaces_producer() {
        let broker = stub("device_descriptor", &[0xde, 0xad, 0xbe, 0xef]);
        let out = broker.produce_plain("device_descriptor", || panic!("producer must not run"));
        assert_eq!(out, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn mutation_is_stage_keyed() {
        let broker = stub("configuration_descriptor", &[0xff]);
        let out = broker.produce_plain("device_descriptor", || vec![1]);
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn stage_logger_records_emission_order() {
        let dir = std::env::temp_dir().join("phantom-usb-stage-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stages.txt");
        let mut broker = MutationBroker::passthrough();
        broker.set_stage_logger(StageLogger::create(&path).unwrap());
        broker.produce_plain("device_descriptor", Vec::new);
        broker.produce_plain("configuration_descriptor", Vec::new);
        broker.produce_plain("device_descriptor", Vec::new);
        let logged = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            logged.lines().collect::<Vec<_>>(),
            vec![
                "device_descriptor",
                "configuration_descriptor",
                "device_descriptor"
            ]
        );
    }
}
