//! Shared fixtures: a fast simulated bench and a scripted measurement type.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stripscan::config::BenchConfig;
use stripscan::controller::{NeedleSettings, TableSettings};
use stripscan::error::{AppResult, BenchError, RunResult};
use stripscan::geometry::{Padfile, Position};
use stripscan::hardware::sim::SimBench;
use stripscan::measurement::{Measurement, MeasurementContext, MeasurementRegistry, Switching};
use stripscan::sequence::{RunOptions, RunRecord, Sequence, SequenceItem, SequenceSettings, SequenceStrategy};
use stripscan::station::{Station, StationSettings};
use stripscan::writer::Writer;

/// Five strips in a row plus an off-axis reference pad.
pub const PADFILE: &str = "# test sensor\n\
    reference pad: S1\n\
    reference pad: S5\n\
    reference pad: R\n\
    \n\
    strip\tx\ty\tz\n\
    S1\t0\t0\t0\n\
    S2\t100\t0\t0\n\
    S3\t200\t0\t0\n\
    S4\t300\t0\t0\n\
    S5\t400\t0\t0\n\
    R\t0\t1000\t0\n";

pub fn padfile() -> Padfile {
    Padfile::parse(PADFILE).unwrap()
}

/// Table positions equal to the design positions.
pub fn alignment() -> [Position; 3] {
    [
        Position::new(0.0, 0.0, 0.0),
        Position::new(400.0, 0.0, 0.0),
        Position::new(0.0, 1000.0, 0.0),
    ]
}

/// Bench configuration without delays.
pub fn config(sequence: SequenceSettings) -> BenchConfig {
    BenchConfig {
        resources: SimBench::resources(),
        table: TableSettings {
            poll_interval: Duration::from_millis(1),
            movement_timeout: Duration::from_secs(5),
            reopen_backoff: Duration::from_millis(10),
            ..TableSettings::default()
        },
        needle: NeedleSettings {
            poll_interval: Duration::from_millis(1),
            movement_timeout: Duration::from_secs(5),
            reopen_backoff: Duration::from_millis(10),
            ..NeedleSettings::default()
        },
        station: StationSettings::immediate(),
        sequence: SequenceSettings {
            approach_delay: Duration::ZERO,
            ..sequence
        },
        ..BenchConfig::default()
    }
}

/// Retry policy with the given attempt counts.
pub fn retries(remeasure_attempts: usize, recontact_attempts: usize) -> SequenceSettings {
    SequenceSettings {
        remeasure_attempts,
        recontact_attempts,
        ..SequenceSettings::default()
    }
}

pub fn options(output: &Path) -> RunOptions {
    RunOptions {
        operator: "Monty".into(),
        sensor_name: "HPK_0001".into(),
        sensor_type: "2S".into(),
        output_dir: Some(output.to_path_buf()),
    }
}

/// Result of the next `acquire` of a scripted item on a strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Analysis out of range.
    Fail,
    /// Source compliance.
    Compliance,
    /// Instrument failure.
    Fault,
    /// Operator abort requested while acquiring.
    Abort,
    /// Bug in the measurement code.
    Panic,
}

/// One hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub item: String,
    pub hook: &'static str,
    pub strip: Option<String>,
}

/// Scripted outcomes and the recorded calls of every scripted item.
#[derive(Debug, Default)]
pub struct Script {
    outcomes: BTreeMap<(String, String), VecDeque<Outcome>>,
    pub calls: Vec<Call>,
}

impl Script {
    /// Queue outcomes for item `name` (full name) on `strip`.
    pub fn push(&mut self, name: &str, strip: &str, outcomes: &[Outcome]) {
        self.outcomes
            .entry((name.to_string(), strip.to_string()))
            .or_default()
            .extend(outcomes.iter().copied());
    }

    /// Calls of `hook`, as (item, strip) pairs.
    pub fn calls_of(&self, hook: &str) -> Vec<(String, Option<String>)> {
        self.calls
            .iter()
            .filter(|call| call.hook == hook)
            .map(|call| (call.item.clone(), call.strip.clone()))
            .collect()
    }

    /// Number of `acquire` calls of `item` on `strip`.
    pub fn acquires(&self, item: &str, strip: &str) -> usize {
        self.calls
            .iter()
            .filter(|call| {
                call.hook == "acquire" && call.item == item && call.strip.as_deref() == Some(strip)
            })
            .count()
    }
}

struct Scripted {
    script: Arc<Mutex<Script>>,
    switching: Switching,
}

impl Scripted {
    fn log(&self, ctx: &MeasurementContext<'_>, hook: &'static str) {
        self.script.lock().calls.push(Call {
            item: ctx.item().name.clone(),
            hook,
            strip: ctx.strip().map(|strip| strip.name.clone()),
        });
    }

    fn next(&self, ctx: &MeasurementContext<'_>) -> Option<Outcome> {
        let strip = ctx.strip()?.name.clone();
        self.script
            .lock()
            .outcomes
            .get_mut(&(ctx.item().name.clone(), strip))
            .and_then(VecDeque::pop_front)
    }
}

impl Measurement for Scripted {
    fn before_sequence(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.log(ctx, "before_sequence");
        Ok(())
    }

    fn after_sequence(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.log(ctx, "after_sequence");
        Ok(())
    }

    fn before_strip(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.log(ctx, "before_strip");
        Ok(())
    }

    fn after_strip(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.log(ctx, "after_strip");
        Ok(())
    }

    fn initialize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.log(ctx, "initialize");
        Ok(ctx.apply_switching(&self.switching)?)
    }

    fn acquire(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.log(ctx, "acquire");
        match self.next(ctx) {
            None => {
                if ctx.strip().is_some() {
                    ctx.insert_strip_data([("value", json!(1.0))]);
                }
                Ok(())
            }
            Some(Outcome::Fail) => {
                Err(BenchError::AnalysisOutOfRange("scripted failure".into()).into())
            }
            Some(Outcome::Compliance) => {
                Err(BenchError::ComplianceTripped("scripted compliance".into()).into())
            }
            Some(Outcome::Fault) => Err(BenchError::HardFault("scripted fault".into()).into()),
            Some(Outcome::Abort) => {
                ctx.control().request_abort();
                Ok(())
            }
            Some(Outcome::Panic) => {
                let samples: Vec<f64> = Vec::new();
                ctx.insert_strip_data([("value", json!(samples[0]))]);
                Ok(())
            }
        }
    }

    fn finalize(&mut self, ctx: &mut MeasurementContext<'_>) -> RunResult<()> {
        self.log(ctx, "finalize");
        Ok(())
    }
}

/// Built-in catalogue plus the `scripted` type.
pub fn registry(script: &Arc<Mutex<Script>>) -> MeasurementRegistry {
    let mut registry = MeasurementRegistry::builtin();
    let script = Arc::clone(script);
    registry.register("scripted", &[], move |parameters| {
        Ok(Box::new(Scripted {
            script: Arc::clone(&script),
            switching: Switching::from_parameters(parameters)?,
        }))
    });
    registry
}

/// Counts writer invocations.
#[derive(Clone, Default)]
pub struct CountingWriter {
    pub count: Arc<AtomicUsize>,
    pub rows: Arc<AtomicUsize>,
}

impl CountingWriter {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Writer for CountingWriter {
    fn write(&mut self, record: &RunRecord) -> AppResult<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let rows = record
            .data
            .values()
            .flat_map(|kinds| kinds.values())
            .flat_map(|names| names.values())
            .map(Vec::len)
            .sum();
        self.rows.store(rows, Ordering::SeqCst);
        Ok(())
    }
}

/// Simulated bench with a strategy wired to it.
pub struct Harness {
    pub bench: SimBench,
    pub script: Arc<Mutex<Script>>,
    pub writer: CountingWriter,
    pub strategy: SequenceStrategy,
}

impl Harness {
    pub fn new(settings: SequenceSettings) -> Self {
        let bench = SimBench::new();
        let script = Arc::new(Mutex::new(Script::default()));
        let config = config(settings);
        let station = Station::new(bench.registry(), &config).unwrap();
        let mut strategy = SequenceStrategy::new(station, config.sequence.clone(), registry(&script));
        strategy.set_padfile(padfile());
        strategy.set_alignment(Some(alignment()));
        let writer = CountingWriter::default();
        strategy.add_writer(writer.clone());
        Self {
            bench,
            script,
            writer,
            strategy,
        }
    }

    /// X coordinates of every lateral table move.
    pub fn contact_x(&self) -> Vec<f64> {
        self.bench
            .table
            .lock()
            .absolute_targets()
            .iter()
            .map(|target| target.x)
            .collect()
    }
}

/// Scripted top level item on `strips` with scripted strip items.
pub fn scripted_sequence(strips: &str, children: &[&str]) -> Sequence {
    let mut item = SequenceItem::new("scripted", "Scan").with_strips(strips);
    for name in children {
        item = item.with_child(SequenceItem::new("scripted", name));
    }
    Sequence {
        name: "Test".into(),
        version: Some("1.0".into()),
        description: String::new(),
        items: vec![item],
    }
}
