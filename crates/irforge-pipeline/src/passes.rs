use crate::{BoxError, ConversionEventKind, ConversionEventSink, Graph, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Front,
    Middle,
    Back,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Front, Stage::Middle, Stage::Back];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Front => "FRONT",
            Self::Middle => "MIDDLE",
            Self::Back => "BACK",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "front" => Ok(Self::Front),
            "middle" => Ok(Self::Middle),
            "back" => Ok(Self::Back),
            other => Err(format!(
                "unknown stage '{other}', expected one of front, middle, back"
            )),
        }
    }
}

/// Identity and ordering metadata of a rewrite pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassDescriptor {
    pub name: String,
    pub stage: Stage,
    pub run_before: BTreeSet<String>,
    pub run_after: BTreeSet<String>,
}

impl PassDescriptor {
    pub fn new(name: impl Into<String>, stage: Stage) -> Self {
        Self {
            name: name.into(),
            stage,
            run_before: BTreeSet::new(),
            run_after: BTreeSet::new(),
        }
    }

    pub fn before(mut self, peer: impl Into<String>) -> Self {
        self.run_before.insert(peer.into());
        self
    }

    pub fn after(mut self, peer: impl Into<String>) -> Self {
        self.run_after.insert(peer.into());
        self
    }
}

pub trait RewritePass: Send {
    fn apply(&mut self, graph: &mut Graph) -> Result<(), BoxError>;
}

impl<F> RewritePass for F
where
    F: FnMut(&mut Graph) -> Result<(), BoxError> + Send,
{
    fn apply(&mut self, graph: &mut Graph) -> Result<(), BoxError> {
        self(graph)
    }
}

pub type PassFactory = Arc<dyn Fn() -> Box<dyn RewritePass> + Send + Sync>;

#[derive(Clone)]
struct PassEntry {
    descriptor: PassDescriptor,
    factory: PassFactory,
}

/// Append-only set of rewrite passes. Registration order is the tie-break
/// between passes that have no ordering constraint between them.
#[derive(Clone, Default)]
pub struct PassRegistry {
    entries: Vec<PassEntry>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, descriptor: PassDescriptor, factory: F) -> Result<(), PipelineError>
    where
        F: Fn() -> Box<dyn RewritePass> + Send + Sync + 'static,
    {
        if self.contains(&descriptor.name) {
            return Err(PipelineError::DuplicatePass {
                name: descriptor.name,
            });
        }
        self.entries.push(PassEntry {
            descriptor,
            factory: Arc::new(factory),
        });
        Ok(())
    }

    pub fn register_pass<P>(&mut self, descriptor: PassDescriptor) -> Result<(), PipelineError>
    where
        P: RewritePass + Default + 'static,
    {
        self.register(descriptor, || Box::new(P::default()) as Box<dyn RewritePass>)
    }

    pub fn register_fn(
        &mut self,
        descriptor: PassDescriptor,
        pass: fn(&mut Graph) -> Result<(), BoxError>,
    ) -> Result<(), PipelineError> {
        self.register(descriptor, move || Box::new(pass) as Box<dyn RewritePass>)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.descriptor.name == name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&PassDescriptor> {
        self.entries
            .iter()
            .map(|entry| &entry.descriptor)
            .find(|descriptor| descriptor.name == name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PassDescriptor> {
        self.entries.iter().map(|entry| &entry.descriptor)
    }

    pub fn descriptors_for(&self, stage: Stage) -> impl Iterator<Item = &PassDescriptor> {
        self.descriptors()
            .filter(move |descriptor| descriptor.stage == stage)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn instantiate(&self, name: &str) -> Option<Box<dyn RewritePass>> {
        self.entries
            .iter()
            .find(|entry| entry.descriptor.name == name)
            .map(|entry| (entry.factory)())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Planning(Stage),
    Executing(Stage),
    Complete(Stage),
    Done,
    Failed(Stage),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub executed: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn executed(&self, stage: Stage) -> Option<&[String]> {
        self.stages
            .iter()
            .find(|report| report.stage == stage)
            .map(|report| report.executed.as_slice())
    }

    pub fn total_executed(&self) -> usize {
        self.stages.iter().map(|report| report.executed.len()).sum()
    }
}

/// Runs registered passes stage by stage, each at most once per scheduler.
pub struct PassScheduler<'a> {
    registry: &'a PassRegistry,
    state: SchedulerState,
    executed: BTreeSet<String>,
    events: ConversionEventSink,
    report: RunReport,
}

impl<'a> PassScheduler<'a> {
    pub fn new(registry: &'a PassRegistry) -> Self {
        Self {
            registry,
            state: SchedulerState::Idle,
            executed: BTreeSet::new(),
            events: ConversionEventSink::default(),
            report: RunReport::default(),
        }
    }

    pub fn with_events(mut self, events: ConversionEventSink) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Computes the execution order of one stage. Among passes that are free
    /// to run, the earliest registered goes first.
    pub fn plan(&self, stage: Stage) -> Result<Vec<String>, PipelineError> {
        let members: Vec<&PassDescriptor> = self.registry.descriptors_for(stage).collect();
        let index: BTreeMap<&str, usize> = members
            .iter()
            .enumerate()
            .map(|(position, descriptor)| (descriptor.name.as_str(), position))
            .collect();

        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); members.len()];
        for (position, descriptor) in members.iter().enumerate() {
            for peer in &descriptor.run_before {
                match index.get(peer.as_str()) {
                    Some(&peer_position) => {
                        successors[position].insert(peer_position);
                    }
                    None => ignored_constraint(stage, &descriptor.name, peer),
                }
            }
            for peer in &descriptor.run_after {
                match index.get(peer.as_str()) {
                    Some(&peer_position) => {
                        successors[peer_position].insert(position);
                    }
                    None => ignored_constraint(stage, &descriptor.name, peer),
                }
            }
        }

        let mut in_degree = vec![0usize; members.len()];
        for targets in &successors {
            for &target in targets {
                in_degree[target] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(position, _)| position)
            .collect();
        let mut order = Vec::with_capacity(members.len());
        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &target in &successors[current] {
                in_degree[target] -= 1;
                if in_degree[target] == 0 {
                    ready.insert(target);
                }
            }
        }

        if order.len() < members.len() {
            let cycle = find_cycle(&successors, &in_degree)
                .into_iter()
                .map(|position| members[position].name.clone())
                .collect();
            return Err(PipelineError::PassCycle { stage, cycle });
        }

        Ok(order
            .into_iter()
            .map(|position| members[position].name.clone())
            .collect())
    }

    pub fn run_stage(&mut self, graph: &mut Graph, stage: Stage) -> Result<StageReport, PipelineError> {
        self.state = SchedulerState::Planning(stage);
        let order = match self.plan(stage) {
            Ok(order) => order,
            Err(error) => {
                self.state = SchedulerState::Failed(stage);
                return Err(error);
            }
        };
        tracing::debug!(stage = %stage, order = ?order, "stage planned");
        self.events.emit(ConversionEventKind::StagePlanned {
            stage,
            order: order.clone(),
        });

        self.state = SchedulerState::Executing(stage);
        let mut report = StageReport {
            stage,
            executed: Vec::with_capacity(order.len()),
        };
        for name in order {
            if let Err(error) = self.execute(graph, stage, &name) {
                self.state = SchedulerState::Failed(stage);
                return Err(error);
            }
            report.executed.push(name);
        }

        self.state = SchedulerState::Complete(stage);
        self.events.emit(ConversionEventKind::StageCompleted {
            stage,
            executed: report.executed.len(),
        });
        self.report.stages.push(report.clone());
        Ok(report)
    }

    /// Runs the requested stages in the order given. A stage listed twice
    /// fails on its first pass with `PassAlreadyExecuted`.
    pub fn run(&mut self, graph: &mut Graph, stages: &[Stage]) -> Result<RunReport, PipelineError> {
        for stage in stages {
            self.run_stage(graph, *stage)?;
        }
        self.state = SchedulerState::Done;
        Ok(self.report.clone())
    }

    fn execute(&mut self, graph: &mut Graph, stage: Stage, name: &str) -> Result<(), PipelineError> {
        if !self.executed.insert(name.to_string()) {
            return Err(PipelineError::PassAlreadyExecuted {
                pass: name.to_string(),
            });
        }
        let mut pass = self
            .registry
            .instantiate(name)
            .ok_or_else(|| PipelineError::PassFailed {
                pass: name.to_string(),
                stage,
                source: "pass disappeared from the registry".into(),
            })?;

        tracing::debug!(stage = %stage, pass = name, "pass started");
        self.events.emit(ConversionEventKind::PassStarted {
            stage,
            pass: name.to_string(),
        });
        pass.apply(graph).map_err(|source| PipelineError::PassFailed {
            pass: name.to_string(),
            stage,
            source,
        })?;
        tracing::debug!(stage = %stage, pass = name, nodes = graph.node_count(), "pass completed");
        self.events.emit(ConversionEventKind::PassCompleted {
            stage,
            pass: name.to_string(),
        });
        Ok(())
    }
}

fn ignored_constraint(stage: Stage, pass: &str, peer: &str) {
    tracing::debug!(
        stage = %stage,
        pass,
        peer,
        "ordering constraint names a pass outside the stage; ignored"
    );
}

/// Names one cycle among the positions Kahn's algorithm could not release.
/// The first element is repeated at the end.
fn find_cycle(successors: &[BTreeSet<usize>], in_degree: &[usize]) -> Vec<usize> {
    let stuck: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree > 0)
        .map(|(position, _)| position)
        .collect();
    let predecessor_of = |target: usize| {
        stuck
            .iter()
            .copied()
            .find(|source| successors[*source].contains(&target))
    };

    let Some(&start) = stuck.first() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut seen = BTreeMap::from([(start, 0usize)]);
    let mut current = start;
    while let Some(previous) = predecessor_of(current) {
        if let Some(&first) = seen.get(&previous) {
            let mut cycle: Vec<usize> = path[first..].to_vec();
            cycle.push(previous);
            cycle.reverse();
            return cycle;
        }
        seen.insert(previous, path.len());
        path.push(previous);
        current = previous;
    }
    path
}
