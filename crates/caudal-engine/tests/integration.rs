//! End-to-end scenarios across the engine: mode resolution, backward
//! requirement propagation, and timestamp continuity at the boundary.

use std::sync::{Arc, Mutex};

use caudal_engine::timestamp::{self, FrameBuffer, InputVerdict};
use caudal_engine::{Engine, EngineConfig, NullHooks};
use caudal_graph::{
    ConfigDirective, ConfigOutcome, DurationMode, DynamicDuration, FrameCtx, GraphArena,
    MediaFormat, ModuleBehavior, PortSamples, ProcessStatus,
};

/// 1:2 interpolator (each input sample yields two output samples), Fixed-
/// Output capable. Records every required-sample push it receives.
struct Interpolator {
    pushed: Arc<Mutex<Vec<PortSamples>>>,
}

impl ModuleBehavior for Interpolator {
    fn configure(&mut self, d: &ConfigDirective<'_>) -> ConfigOutcome {
        if let ConfigDirective::RequiredSamples {
            is_input: true,
            entries,
        } = d
        {
            self.pushed.lock().unwrap().extend_from_slice(entries);
        }
        ConfigOutcome::Applied
    }

    fn process(&mut self, _ctx: &mut FrameCtx) -> ProcessStatus {
        ProcessStatus::Starved
    }

    fn dynamic_duration(&self) -> Option<&dyn DynamicDuration> {
        Some(self)
    }
}

impl DynamicDuration for Interpolator {
    fn required_input_samples(&self, output_samples: u32) -> u32 {
        output_samples.div_ceil(2)
    }
}

struct Inert;

impl ModuleBehavior for Inert {
    fn configure(&mut self, _d: &ConfigDirective<'_>) -> ConfigOutcome {
        ConfigOutcome::Applied
    }

    fn process(&mut self, _ctx: &mut FrameCtx) -> ProcessStatus {
        ProcessStatus::Starved
    }
}

/// Declines every duration-mode offer, as a module whose rate is driven
/// entirely by its own stream would.
struct SelfTimed;

impl ModuleBehavior for SelfTimed {
    fn configure(&mut self, d: &ConfigDirective<'_>) -> ConfigOutcome {
        match d {
            ConfigDirective::DurationMode(_) => ConfigOutcome::Rejected,
            ConfigDirective::RequiredSamples { .. } => ConfigOutcome::Applied,
        }
    }

    fn process(&mut self, _ctx: &mut FrameCtx) -> ProcessStatus {
        ProcessStatus::Starved
    }
}

fn pcm_48k_mono() -> MediaFormat {
    MediaFormat {
        sample_rate: 48_000,
        channels: 1,
        bytes_per_sample: 2,
    }
}

#[test]
fn threshold_requirement_propagates_through_interpolator() {
    let pushed = Arc::new(Mutex::new(Vec::new()));
    let mut arena = GraphArena::new();
    let interp = arena.add_module(
        "interp",
        Box::new(Interpolator {
            pushed: Arc::clone(&pushed),
        }),
        1,
        1,
    );
    let gate = arena.add_module("gate", Box::new(Inert), 1, 1);
    arena.module_mut(interp).unwrap().flags.needs_dynamic_duration = true;
    {
        let rec = arena.module_mut(gate).unwrap();
        rec.flags.is_threshold = true;
        rec.threshold_frame = Some(320);
    }
    let interp_out = arena.module(interp).unwrap().outputs[0];
    let gate_in = arena.module(gate).unwrap().inputs[0];
    arena.connect(interp_out, gate_in).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    engine.prepare(&mut arena, &mut NullHooks).unwrap();

    // The downstream threshold pins the interpolator to Fixed-Output, and
    // backward queries start at the threshold module.
    assert_eq!(
        arena.module(interp).unwrap().flags.duration_mode,
        DurationMode::FixedOutput
    );
    assert_eq!(engine.resolver().query_starts(), &[gate]);

    // 320 samples wanted at the gate become 160 at the interpolator input.
    assert_eq!(
        arena.port(gate_in).unwrap().requirement.max.samples_per_channel,
        320
    );
    assert_eq!(
        arena
            .port(interp_out)
            .unwrap()
            .requirement
            .max
            .samples_per_channel,
        320
    );
    let interp_in = arena.module(interp).unwrap().inputs[0];
    assert_eq!(
        arena
            .port(interp_in)
            .unwrap()
            .requirement
            .max
            .samples_per_channel,
        160
    );

    assert_eq!(
        &*pushed.lock().unwrap(),
        &[PortSamples {
            port_index: 0,
            samples_per_channel: 160
        }]
    );
}

#[test]
fn max_requirement_survives_a_smaller_reconfiguration() {
    let pushed = Arc::new(Mutex::new(Vec::new()));
    let mut arena = GraphArena::new();
    let interp = arena.add_module(
        "interp",
        Box::new(Interpolator {
            pushed: Arc::clone(&pushed),
        }),
        1,
        1,
    );
    let gate = arena.add_module("gate", Box::new(Inert), 1, 1);
    arena.module_mut(interp).unwrap().flags.needs_dynamic_duration = true;
    {
        let rec = arena.module_mut(gate).unwrap();
        rec.flags.is_threshold = true;
        rec.threshold_frame = Some(320);
    }
    let interp_out = arena.module(interp).unwrap().outputs[0];
    let gate_in = arena.module(gate).unwrap().inputs[0];
    arena.connect(interp_out, gate_in).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    engine.prepare(&mut arena, &mut NullHooks).unwrap();
    arena.module_mut(gate).unwrap().threshold_frame = Some(100);
    engine.prepare(&mut arena, &mut NullHooks).unwrap();

    // Buffer sizing stays an upper bound for every observed configuration.
    let interp_in = arena.module(interp).unwrap().inputs[0];
    assert_eq!(
        arena
            .port(interp_in)
            .unwrap()
            .requirement
            .max
            .samples_per_channel,
        160
    );
}

#[test]
fn threshold_module_without_frame_uses_container_frame_size() {
    let mut arena = GraphArena::new();
    let gate = arena.add_module("gate", Box::new(Inert), 1, 1);
    arena.module_mut(gate).unwrap().flags.is_threshold = true;
    // A Fixed-Output feeder makes the gate a query start.
    let pushed = Arc::new(Mutex::new(Vec::new()));
    let interp = arena.add_module(
        "interp",
        Box::new(Interpolator { pushed }),
        1,
        1,
    );
    arena.module_mut(interp).unwrap().flags.needs_dynamic_duration = true;
    let interp_out = arena.module(interp).unwrap().outputs[0];
    let gate_in = arena.module(gate).unwrap().inputs[0];
    arena.connect(interp_out, gate_in).unwrap();

    let cfg = EngineConfig::default();
    let frame = cfg.frame_samples;
    let mut engine = Engine::new(cfg);
    engine.prepare(&mut arena, &mut NullHooks).unwrap();

    assert_eq!(
        arena.port(gate_in).unwrap().requirement.max.samples_per_channel,
        frame
    );
}

#[test]
fn external_output_anchor_converts_through_its_ratio() {
    let pushed = Arc::new(Mutex::new(Vec::new()));
    let mut arena = GraphArena::new();
    let agc = arena.add_module("agc", Box::new(Inert), 1, 1);
    let interp = arena.add_module(
        "interp",
        Box::new(Interpolator {
            pushed: Arc::clone(&pushed),
        }),
        1,
        1,
    );
    arena.module_mut(interp).unwrap().flags.needs_dynamic_duration = true;
    let agc_out = arena.module(agc).unwrap().outputs[0];
    let interp_in = arena.module(interp).unwrap().inputs[0];
    arena.connect(agc_out, interp_in).unwrap();
    let interp_out = arena.module(interp).unwrap().outputs[0];
    arena.open_external(interp_out).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    engine.prepare(&mut arena, &mut NullHooks).unwrap();

    // With the container consuming its output directly, the interpolator is
    // the fixed-output boundary and the query starts at the module itself.
    assert_eq!(
        arena.module(interp).unwrap().flags.duration_mode,
        DurationMode::FixedOutput
    );
    assert_eq!(engine.resolver().query_starts(), &[interp]);

    // 480 frame samples wanted at the external output become 240 at the
    // interpolator input, and the converted count crosses the plain module.
    assert_eq!(
        arena
            .port(interp_out)
            .unwrap()
            .requirement
            .max
            .samples_per_channel,
        480
    );
    assert_eq!(
        arena
            .port(interp_in)
            .unwrap()
            .requirement
            .max
            .samples_per_channel,
        240
    );
    assert_eq!(
        arena.port(agc_out).unwrap().requirement.max.samples_per_channel,
        240
    );
    assert_eq!(
        &*pushed.lock().unwrap(),
        &[PortSamples {
            port_index: 0,
            samples_per_channel: 240
        }]
    );
}

#[test]
fn fork_requirement_lands_on_the_walked_output() {
    let pushed = Arc::new(Mutex::new(Vec::new()));
    let mut arena = GraphArena::new();
    let fork = arena.add_module("fork", Box::new(Inert), 1, 2);
    let bypass = arena.add_module("bypass", Box::new(SelfTimed), 1, 1);
    let interp = arena.add_module(
        "interp",
        Box::new(Interpolator {
            pushed: Arc::clone(&pushed),
        }),
        1,
        1,
    );
    let gate = arena.add_module("gate", Box::new(Inert), 1, 1);
    arena.module_mut(bypass).unwrap().flags.needs_dynamic_duration = true;
    arena.module_mut(interp).unwrap().flags.needs_dynamic_duration = true;
    {
        let rec = arena.module_mut(gate).unwrap();
        rec.flags.is_threshold = true;
        rec.threshold_frame = Some(320);
    }
    // The chain hangs off the fork's second output.
    let fork_out1 = arena.module(fork).unwrap().outputs[1];
    let bypass_in = arena.module(bypass).unwrap().inputs[0];
    arena.connect(fork_out1, bypass_in).unwrap();
    let bypass_out = arena.module(bypass).unwrap().outputs[0];
    let interp_in = arena.module(interp).unwrap().inputs[0];
    arena.connect(bypass_out, interp_in).unwrap();
    let interp_out = arena.module(interp).unwrap().outputs[0];
    let gate_in = arena.module(gate).unwrap().inputs[0];
    arena.connect(interp_out, gate_in).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    engine.prepare(&mut arena, &mut NullHooks).unwrap();

    // The self-timed module declined a mode and processes fixed-size, so the
    // walk crosses it unchanged and ends at the fork.
    assert_eq!(
        arena.module(bypass).unwrap().flags.duration_mode,
        DurationMode::Invalid
    );
    assert_eq!(engine.resolver().query_starts(), &[gate]);

    // The converted count lands on the output the walk came through, not on
    // the fork's first output.
    let fork_out0 = arena.module(fork).unwrap().outputs[0];
    assert_eq!(
        arena
            .port(fork_out1)
            .unwrap()
            .requirement
            .max
            .samples_per_channel,
        160
    );
    assert!(!arena.port(fork_out0).unwrap().requirement.max.is_updated);
    assert_eq!(
        arena.port(fork_out0).unwrap().requirement.max.samples_per_channel,
        0
    );
}

#[test]
fn input_gap_blocks_accumulation_until_drained() {
    let mut arena = GraphArena::new();
    let sink = arena.add_module("capture", Box::new(Inert), 1, 0);
    let input = arena.module(sink).unwrap().inputs[0];
    arena.open_external(input).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    engine.set_format(&mut arena, input, pcm_48k_mono()).unwrap();

    // 10 ms of audio at t=0.
    let verdict = engine
        .accept_input(&mut arena, input, &FrameBuffer::new(vec![0; 960], 0))
        .unwrap();
    assert_eq!(verdict, InputVerdict::Started);
    assert_eq!(arena.port(input).unwrap().buffered_bytes, 960);

    // The next buffer claims t=20 ms while t=0 data is still local.
    let verdict = engine
        .accept_input(&mut arena, input, &FrameBuffer::new(vec![0; 960], 20_000))
        .unwrap();
    assert_eq!(verdict, InputVerdict::Discontinuous { gap_us: 20_000 });
    // Not accumulated: pre-gap data must drain first.
    assert_eq!(arena.port(input).unwrap().buffered_bytes, 960);

    engine.consume_input(&mut arena, input, 960).unwrap();
    let rec = arena.port(input).unwrap().timestamp.as_ref().unwrap();
    assert!(!rec.discontinuity);
    assert_eq!(rec.timestamp_us, 20_000);

    // Post-gap data now lines up with the jumped expectation.
    let verdict = engine
        .accept_input(&mut arena, input, &FrameBuffer::new(vec![0; 960], 20_000))
        .unwrap();
    assert_eq!(verdict, InputVerdict::Contiguous);
}

#[test]
fn gap_with_drained_accumulator_does_not_block() {
    let mut arena = GraphArena::new();
    let sink = arena.add_module("capture", Box::new(Inert), 1, 0);
    let input = arena.module(sink).unwrap().inputs[0];
    arena.open_external(input).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    engine.set_format(&mut arena, input, pcm_48k_mono()).unwrap();

    engine
        .accept_input(&mut arena, input, &FrameBuffer::new(vec![0; 960], 0))
        .unwrap();
    engine.consume_input(&mut arena, input, 960).unwrap();

    // Everything before the gap is gone, so the expectation jumps in place
    // and the post-gap buffer accumulates immediately.
    let verdict = engine
        .accept_input(&mut arena, input, &FrameBuffer::new(vec![0; 960], 30_000))
        .unwrap();
    assert_eq!(verdict, InputVerdict::Discontinuous { gap_us: 20_000 });
    assert_eq!(arena.port(input).unwrap().buffered_bytes, 960);
    let rec = arena.port(input).unwrap().timestamp.as_ref().unwrap();
    assert!(!rec.discontinuity);
    assert_eq!(rec.timestamp_us, 30_000);

    // Consuming the post-gap data advances from the jumped position, not
    // from where the gap opened.
    engine.consume_input(&mut arena, input, 960).unwrap();
    let verdict = engine
        .accept_input(&mut arena, input, &FrameBuffer::new(vec![0; 960], 40_000))
        .unwrap();
    assert_eq!(verdict, InputVerdict::Contiguous);
}

#[test]
fn small_gaps_bridge_with_whole_millisecond_silence() {
    let fmt = pcm_48k_mono();
    let cfg = EngineConfig::default();

    // 2.3 ms rounds up to 3 ms: 144 samples of 16-bit silence.
    let silence = timestamp::bridge_gap(&fmt, 2_300, cfg.gap_drop_threshold_us).unwrap();
    assert_eq!(silence.len(), 288);
    assert!(silence.iter().all(|&b| b == 0));

    // At or above the drop threshold nothing is synthesized.
    assert!(
        timestamp::bridge_gap(&fmt, cfg.gap_drop_threshold_us, cfg.gap_drop_threshold_us)
            .is_none()
    );
}

#[test]
fn misplaced_output_tail_is_held_and_prepended() {
    let mut arena = GraphArena::new();
    let src = arena.add_module("render", Box::new(Inert), 0, 1);
    let output = arena.module(src).unwrap().outputs[0];
    arena.open_external(output).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    engine
        .set_format(&mut arena, output, pcm_48k_mono())
        .unwrap();

    // First delivery establishes the extrapolation at t=0.
    let first = engine
        .collect_output(&mut arena, output, FrameBuffer::new(vec![1; 960], 0))
        .unwrap()
        .unwrap();
    assert_eq!(first.timestamp_us, 0);
    assert_eq!(first.data.len(), 960);

    // A buffer breaking mid-way: 480 contiguous bytes, then a jump to 50 ms.
    let mut broken = FrameBuffer::new(vec![2; 960], 10_000);
    broken.discontinuity = Some(timestamp::Discontinuity {
        pos_bytes: 480,
        resume_timestamp_us: 50_000,
    });
    let head = engine
        .collect_output(&mut arena, output, broken)
        .unwrap()
        .unwrap();
    assert_eq!(head.timestamp_us, 10_000);
    assert_eq!(head.data.len(), 480);
    assert!(head.end_of_frame);

    // The held 480-byte tail rides in front of the next delivery, which
    // continues at the extrapolated 55 ms (50 ms resume plus 5 ms of tail).
    let next = engine
        .collect_output(&mut arena, output, FrameBuffer::new(vec![3; 480], 55_000))
        .unwrap()
        .unwrap();
    assert_eq!(next.timestamp_us, 50_000);
    assert_eq!(next.data.len(), 960);
    assert_eq!(next.data[0], 2);
    assert_eq!(next.data[480], 3);

    // Nothing is held back any more and the record reflects that.
    let rec = arena.port(output).unwrap().timestamp.as_ref().unwrap();
    assert!(!rec.discontinuity);
}
