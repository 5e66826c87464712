use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ralf::operator::{self, Identity};
use ralf::policy::{EmptyCandidateSet, RandomSample};
use ralf::{
    record, schema, Engine, EngineConfig, EngineError, IterSource, LocalClient, QueryClient, SourcePoll, Table,
    Value,
};

fn trace() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .compact()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_idle_wait(Duration::from_millis(5))
        .with_source_poll_interval(Duration::from_millis(1))
}

/// Polls `done` until it holds or five seconds pass
fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

fn current(table: &Table, key: impl Into<Value>, field: &str) -> Option<Value> {
    table.get(&key.into()).and_then(|record| record.get(field).cloned())
}

#[test]
fn workers_keep_tables_fresh() {
    trace();
    let mut engine = Engine::with_config(config());
    let schema = schema!(id: Int, n: Int).unwrap();
    let numbers = engine.create_source("numbers", schema.clone()).unwrap();
    let copy = numbers.map("copy", schema.clone(), Identity).unwrap();

    engine.start().unwrap();
    assert!(engine.is_running());

    for n in 0..1_000 {
        numbers.insert(record!(schema, "id" => n % 10, "n" => n).unwrap()).unwrap();
    }

    // every key settles on the last value written for it
    assert!(eventually(|| {
        (0..10i64).all(|id| current(&copy, id, "n") == Some(Value::from(990 + id)))
    }));

    engine.stop().unwrap();
    assert!(!engine.is_running());
    assert!(!engine.has_pending());
}

#[test]
fn graph_is_frozen_while_running() {
    let mut engine = Engine::with_config(config());
    let schema = schema!(id: Int).unwrap();
    let numbers = engine.create_source("numbers", schema.clone()).unwrap();

    engine.start().unwrap();
    assert!(matches!(engine.start(), Err(EngineError::EngineRunning)));
    assert!(matches!(engine.run_once(), Err(EngineError::EngineRunning)));
    assert!(matches!(engine.run_until_idle(), Err(EngineError::EngineRunning)));
    assert!(matches!(
        numbers.map("copy", schema.clone(), Identity),
        Err(EngineError::EngineRunning)
    ));
    assert!(matches!(
        engine.create_source("more", schema.clone()),
        Err(EngineError::EngineRunning)
    ));

    // inserting is fine
    numbers.insert(record!(schema, "id" => 1).unwrap()).unwrap();
    assert!(eventually(|| numbers.get(&Value::from(1)).is_some()));

    engine.stop().unwrap();
    numbers.map("copy", schema.clone(), Identity).unwrap();
    numbers.insert(record!(schema, "id" => 2).unwrap()).unwrap();
    engine.run_until_idle().unwrap();

    // the new table only sees updates made after it was declared
    let copy = engine.table("copy").unwrap();
    assert!(copy.get(&Value::from(1)).is_none());
    assert!(copy.get(&Value::from(2)).is_some());
}

#[test]
fn attached_sources_are_polled() {
    trace();
    let mut engine = Engine::with_config(config());
    let schema = schema!(id: Int, n: Int).unwrap();
    let records: Vec<_> = (0..500)
        .map(|n| record!(schema, "id" => n % 25, "n" => n).unwrap())
        .collect();

    let numbers = engine
        .create_source_with("numbers", schema.clone(), IterSource::new(records, 16))
        .unwrap();
    let copy = numbers.map("copy", schema.clone(), Identity).unwrap();

    engine.start().unwrap();
    assert!(eventually(|| {
        (0..25i64).all(|id| current(&copy, id, "n") == Some(Value::from(475 + id)))
    }));
    engine.stop().unwrap();

    assert_eq!(copy.len(), 25);
}

#[test]
fn attached_sources_drive_synchronous_runs() {
    let mut engine = Engine::new();
    let schema = schema!(id: Int, n: Int).unwrap();

    // produces a batch on every other poll, then runs dry
    let mut polls: i64 = 0;
    let source_schema = schema.clone();
    let source = move || -> anyhow::Result<SourcePoll> {
        polls += 1;
        if polls > 10 {
            return Ok(SourcePoll::Exhausted);
        }
        if polls % 2 == 0 {
            return Ok(SourcePoll::Idle);
        }
        let record = source_schema.record([("id", Value::from(polls)), ("n", Value::from(polls * 10))])?;
        Ok(SourcePoll::Records(vec![record]))
    };

    let numbers = engine.create_source_with("numbers", schema.clone(), source).unwrap();

    // an idle source ends the run
    engine.run_until_idle().unwrap();
    assert_eq!(numbers.len(), 1);

    for _ in 0..10 {
        engine.run_until_idle().unwrap();
    }
    let ids: Vec<Value> = numbers.scan().map(|(key, _)| key).collect();
    assert_eq!(ids, [1i64, 3, 5, 7, 9].map(Value::from));
}

#[test]
fn failing_sources_stop_the_engine() {
    let mut engine = Engine::new();
    let schema = schema!(id: Int).unwrap();
    engine
        .create_source_with("broken", schema, || -> anyhow::Result<SourcePoll> {
            anyhow::bail!("connection reset")
        })
        .unwrap();

    let err = engine.run_until_idle().unwrap_err();
    assert!(matches!(&err, EngineError::Source { table, .. } if table == "broken"));
    assert!(err.to_string().contains("connection reset"));
}

#[test]
fn bad_policies_are_reported_on_stop() {
    let mut engine = Engine::with_config(config());
    let schema = schema!(id: Int).unwrap();
    let numbers = engine.create_source("numbers", schema.clone()).unwrap();
    numbers.add_prioritization_policy(|_: &[Value]| -> Result<Value, EmptyCandidateSet> {
        Ok(Value::from(-1))
    });

    engine.start().unwrap();
    numbers.insert(record!(schema, "id" => 1).unwrap()).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let err = engine.stop().unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, EngineError::InvalidChoice { table, .. } if table == "numbers"));
}

#[test]
fn sampling_under_load() {
    trace();
    let mut engine = Engine::with_config(config());
    let schema = schema!(id: Int, n: Int).unwrap();
    let numbers = engine.create_source("numbers", schema.clone()).unwrap();
    let sampled = numbers
        .map(
            "sampled",
            schema.clone(),
            operator::from_fn(|input, _| Ok(Some(input.record().clone()))),
        )
        .unwrap();
    sampled.add_load_shedding(RandomSample::seeded(0.5, 3));

    engine.start().unwrap();
    for n in 0..2_000 {
        numbers.insert(record!(schema, "id" => n % 50, "n" => n).unwrap()).unwrap();
    }

    // every candidate is either shed or materialized once the graph drains
    assert!(eventually(|| {
        let (source, stats) = (numbers.stats(), sampled.stats());
        source.materialized + source.coalesced == 2_000
            && stats.inserted == source.materialized
            && stats.inserted == stats.coalesced + stats.shed + stats.materialized
    }));
    engine.stop().unwrap();

    let stats = sampled.stats();
    assert!(stats.shed > 0);
    assert!(stats.materialized > 0);

    // whatever was kept came from the parent, values never go backwards
    let parent: BTreeMap<Value, _> = numbers.scan().collect();
    for (key, record) in sampled.scan() {
        let kept = record.get("n").and_then(Value::as_i64).unwrap();
        let latest = parent[&key].get("n").and_then(Value::as_i64).unwrap();
        assert!(kept <= latest);
    }
}

#[test]
fn reads_run_alongside_workers() {
    trace();
    let mut engine = Engine::with_config(config());
    let schema = schema!(id: Int, n: Int).unwrap();
    let doubled_schema = schema!(id: Int, n: Int, twice: Int).unwrap();
    let numbers = engine.create_source("numbers", schema.clone()).unwrap();
    let doubled = numbers
        .map(
            "doubled",
            doubled_schema,
            operator::from_fn(|input, ctx| {
                let n = input.record().get("n").and_then(Value::as_i64).unwrap_or_default();
                let out = ctx.schema().record([
                    ("id", ctx.key().clone()),
                    ("n", Value::from(n)),
                    ("twice", Value::from(n * 2)),
                ])?;
                Ok(Some(out))
            }),
        )
        .unwrap();
    doubled.mark_queryable("doubled").unwrap();

    let client = LocalClient::new(engine.query_server());
    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let (client, done) = (client.clone(), done.clone());
            thread::spawn(move || {
                let consistent = |record: &ralf::Record| {
                    let n = record.get("n").and_then(Value::as_i64);
                    let twice = record.get("twice").and_then(Value::as_i64);
                    n.map(|n| n * 2) == twice
                };
                let mut reads = 0usize;
                while !done.load(Ordering::SeqCst) {
                    for record in client.bulk_query("doubled").unwrap() {
                        assert!(consistent(&record), "torn record {}", record);
                    }
                    match client.point_query("doubled", &Value::from(3)) {
                        Ok(record) => assert!(consistent(&record), "torn record {}", record),
                        Err(err) => assert!(matches!(err, EngineError::KeyNotFound { .. })),
                    }
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    engine.start().unwrap();
    for n in 0..5_000 {
        numbers.insert(record!(schema, "id" => n % 20, "n" => n).unwrap()).unwrap();
    }
    assert!(eventually(|| {
        (0..20i64).all(|id| current(&doubled, id, "twice") == Some(Value::from(2 * (4_980 + id))))
    }));
    engine.stop().unwrap();

    done.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
}

#[test]
fn declarations_racing_start_get_workers() {
    let schema = schema!(id: Int).unwrap();
    for round in 0..50 {
        let mut engine = Engine::with_config(config());
        let numbers = engine.create_source("numbers", schema.clone()).unwrap();

        let declare = {
            let (numbers, schema) = (numbers.clone(), schema.clone());
            thread::spawn(move || numbers.map("copy", schema, Identity))
        };
        engine.start().unwrap();

        match declare.join().unwrap() {
            // declared in time, so it has a worker keeping it fresh
            Ok(copy) => {
                numbers.insert(record!(schema, "id" => round).unwrap()).unwrap();
                assert!(eventually(|| copy.get(&Value::from(round)).is_some()));
            }
            Err(err) => assert!(matches!(err, EngineError::EngineRunning)),
        }
        engine.stop().unwrap();
    }
}
