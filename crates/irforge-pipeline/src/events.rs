use crate::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub sequence_no: u64,
    pub kind: ConversionEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversionEventKind {
    LoadStarted {
        input: PathBuf,
    },
    GraphBuilt {
        node_count: usize,
        edge_count: usize,
    },
    ExtractorsResolved {
        node_count: usize,
    },
    StagePlanned {
        stage: Stage,
        order: Vec<String>,
    },
    PassStarted {
        stage: Stage,
        pass: String,
    },
    PassCompleted {
        stage: Stage,
        pass: String,
    },
    StageCompleted {
        stage: Stage,
        executed: usize,
    },
    Emitted {
        topology: PathBuf,
        weights: PathBuf,
    },
    Failed {
        reason: String,
    },
}

pub trait ConversionEventObserver: Send + Sync {
    fn on_event(&self, event: &ConversionEvent);
}

impl<F> ConversionEventObserver for F
where
    F: Fn(&ConversionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ConversionEvent) {
        self(event);
    }
}

pub type SharedConversionEventObserver = Arc<dyn ConversionEventObserver>;
pub type ConversionEventSender = mpsc::Sender<ConversionEvent>;
pub type ConversionEventReceiver = mpsc::Receiver<ConversionEvent>;

/// Fan-out point for conversion progress. Clones share one sequence counter.
#[derive(Clone, Default)]
pub struct ConversionEventSink {
    observer: Option<SharedConversionEventObserver>,
    sender: Option<ConversionEventSender>,
    sequence: Arc<AtomicU64>,
}

impl ConversionEventSink {
    pub fn with_observer(observer: SharedConversionEventObserver) -> Self {
        Self {
            observer: Some(observer),
            ..Self::default()
        }
    }

    pub fn with_sender(sender: ConversionEventSender) -> Self {
        Self {
            sender: Some(sender),
            ..Self::default()
        }
    }

    pub fn observer(mut self, observer: SharedConversionEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: ConversionEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, kind: ConversionEventKind) {
        if !self.is_enabled() {
            return;
        }
        let event = ConversionEvent {
            sequence_no: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            kind,
        };
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn conversion_event_channel() -> (ConversionEventSender, ConversionEventReceiver) {
    mpsc::channel()
}
