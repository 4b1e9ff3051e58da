use irforge_pipeline::{
    BoxError, ConversionEventKind, ConversionEventSink, Graph, PassDescriptor, PassRegistry,
    PassScheduler, PipelineError, RewritePass, SchedulerState, Stage, builtin_passes,
    conversion_event_channel,
};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<(Stage, String)>>>;

fn recording(registry: &mut PassRegistry, log: &Log, descriptor: PassDescriptor) {
    let log = Arc::clone(log);
    let entry = (descriptor.stage, descriptor.name.clone());
    registry
        .register(descriptor, move || {
            let log = Arc::clone(&log);
            let entry = entry.clone();
            Box::new(move |_graph: &mut Graph| -> Result<(), BoxError> {
                log.lock().expect("log mutex should lock").push(entry.clone());
                Ok(())
            }) as Box<dyn RewritePass>
        })
        .expect("registration should succeed");
}

fn position(order: &[String], name: &str) -> usize {
    order
        .iter()
        .position(|candidate| candidate == name)
        .unwrap_or_else(|| panic!("'{name}' missing from {order:?}"))
}

#[test]
fn plan_acyclic_constraints_expected_every_constraint_honored() {
    let log: Log = Arc::default();
    let mut registry = PassRegistry::new();
    let descriptors = vec![
        PassDescriptor::new("fuse", Stage::Middle).after("infer").before("cleanup"),
        PassDescriptor::new("cleanup", Stage::Middle),
        PassDescriptor::new("infer", Stage::Middle),
        PassDescriptor::new("layout", Stage::Middle).before("infer"),
        PassDescriptor::new("fold", Stage::Middle).after("layout").before("fuse"),
        PassDescriptor::new("stats", Stage::Middle),
    ];
    for descriptor in descriptors.clone() {
        recording(&mut registry, &log, descriptor);
    }

    let order = PassScheduler::new(&registry)
        .plan(Stage::Middle)
        .expect("acyclic constraints should plan");

    assert_eq!(order.len(), descriptors.len());
    for descriptor in &descriptors {
        for peer in &descriptor.run_before {
            assert!(position(&order, &descriptor.name) < position(&order, peer));
        }
        for peer in &descriptor.run_after {
            assert!(position(&order, peer) < position(&order, &descriptor.name));
        }
    }
    assert_eq!(
        order,
        vec!["layout", "infer", "fold", "fuse", "cleanup", "stats"]
    );
}

#[test]
fn plan_same_registry_twice_expected_identical_order() {
    let registry = builtin_passes().expect("builtin passes");
    let scheduler = PassScheduler::new(&registry);

    for stage in Stage::ALL {
        let first = scheduler.plan(stage).expect("plan");
        let second = scheduler.plan(stage).expect("plan");
        assert_eq!(first, second);
    }
}

#[test]
fn run_cycle_in_back_stage_expected_earlier_stages_complete_and_cycle_error() {
    let log: Log = Arc::default();
    let mut registry = PassRegistry::new();
    recording(&mut registry, &log, PassDescriptor::new("front", Stage::Front));
    recording(&mut registry, &log, PassDescriptor::new("p", Stage::Back).after("q"));
    recording(&mut registry, &log, PassDescriptor::new("q", Stage::Back).after("p"));
    let mut graph = Graph::new("m");
    let mut scheduler = PassScheduler::new(&registry);

    let error = scheduler
        .run(&mut graph, &Stage::ALL)
        .expect_err("cycle must fail");

    assert!(matches!(error, PipelineError::PassCycle { stage: Stage::Back, .. }));
    assert_eq!(
        log.lock().expect("log mutex should lock").as_slice(),
        &[(Stage::Front, "front".to_string())]
    );
    assert_eq!(scheduler.state(), SchedulerState::Failed(Stage::Back));
}

#[test]
fn run_all_stages_expected_no_pass_of_later_stage_before_earlier_stage_done() {
    let log: Log = Arc::default();
    let mut registry = PassRegistry::new();
    recording(&mut registry, &log, PassDescriptor::new("b1", Stage::Back));
    recording(&mut registry, &log, PassDescriptor::new("m1", Stage::Middle));
    recording(&mut registry, &log, PassDescriptor::new("f1", Stage::Front));
    recording(&mut registry, &log, PassDescriptor::new("m2", Stage::Middle).before("m1"));
    recording(&mut registry, &log, PassDescriptor::new("f2", Stage::Front));
    let mut graph = Graph::new("m");

    let report = PassScheduler::new(&registry)
        .run(&mut graph, &Stage::ALL)
        .expect("run should succeed");

    let stages: Vec<Stage> = log
        .lock()
        .expect("log mutex should lock")
        .iter()
        .map(|(stage, _)| *stage)
        .collect();
    assert!(stages.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(report.executed(Stage::Middle), Some(&["m2".to_string(), "m1".to_string()][..]));
    assert_eq!(report.total_executed(), 5);
}

#[test]
fn run_with_events_expected_planned_started_completed_sequence() {
    let log: Log = Arc::default();
    let mut registry = PassRegistry::new();
    recording(&mut registry, &log, PassDescriptor::new("only", Stage::Middle));
    let (tx, rx) = conversion_event_channel();
    let mut graph = Graph::new("m");

    PassScheduler::new(&registry)
        .with_events(ConversionEventSink::with_sender(tx))
        .run(&mut graph, &[Stage::Middle])
        .expect("run should succeed");

    let kinds: Vec<ConversionEventKind> = rx.try_iter().map(|event| event.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ConversionEventKind::StagePlanned {
                stage: Stage::Middle,
                order: vec!["only".to_string()],
            },
            ConversionEventKind::PassStarted {
                stage: Stage::Middle,
                pass: "only".to_string(),
            },
            ConversionEventKind::PassCompleted {
                stage: Stage::Middle,
                pass: "only".to_string(),
            },
            ConversionEventKind::StageCompleted {
                stage: Stage::Middle,
                executed: 1,
            },
        ]
    );
}
