use anyhow::{Context, Result};
use clap::Parser;
use simplelog::*;
use std::path::PathBuf;

use keyweave::sim::{HostAction, SimPlatform, Simulator};
use keyweave_core::combo::{Combo, ComboAction, ComboPipeline};
use keyweave_core::executor::{Executor, PhysicalPipeline, VirtualPipeline};
use keyweave_core::key_code::*;
use keyweave_core::key_replacer::{KeyReplacerPipeline, Replacement, SequenceEvent};
use keyweave_core::one_shot::{OneShotModifier, OneShotPipeline};
use keyweave_core::platform::KeyPos;
use keyweave_core::tap_dance::{
    HoldStrategy, TapDanceAction, TapDanceBehavior, TapDancePipeline,
};

#[derive(Parser, Debug)]
#[command(author, version, verbatim_doc_comment)]
/// keyweave-sim: replay a scripted key-event sequence through the keyweave
/// pipelines and print the host actions that would result.
///
/// The script is a whitespace-separated list of items:
///   d:<row>,<col>   press the key at that matrix position
///   u:<row>,<col>   release it
///   t:<ms>          advance time
///
/// Example: `d:0,0 t:150 u:0,0` taps the demo tap-dance key for 150ms.
struct Args {
    /// Simulation script file.
    sim: PathBuf,

    /// Enable debug logging of pipeline decisions.
    #[arg(short, long)]
    debug: bool,
}

// The demo layout the simulator runs against. Row 0 carries the pipeline
// trigger keys, row 1 the combo pair; layer 1 is what the tap-dance hold
// activates.
static DEMO_TD_ACTIONS: [TapDanceAction; 3] = [
    TapDanceAction::tap_key(1, KC_A),
    TapDanceAction::hold_layer(1, 1, HoldStrategy::Balanced),
    TapDanceAction::tap_key(2, KC_D),
];
static DEMO_BEHAVIORS: [TapDanceBehavior; 1] =
    [TapDanceBehavior::new(Keycode::tap_dance(0), &DEMO_TD_ACTIONS)];

static DEMO_COMBO_KEYS: [KeyPos; 2] = [KeyPos::new(1, 0), KeyPos::new(1, 1)];
static DEMO_COMBOS: [Combo; 1] = [Combo::new(
    &DEMO_COMBO_KEYS,
    ComboAction::Register(KC_X),
    ComboAction::Unregister(KC_X),
)];

static DEMO_ONE_SHOTS: [OneShotModifier; 1] =
    [OneShotModifier::new(Keycode::one_shot_mod(0), KC_LSFT)];

const KC_REPLACED: Keycode = Keycode::new(0x7100);
static DEMO_REPL_PRESS: [SequenceEvent; 2] =
    [SequenceEvent::Press(KC_LSFT), SequenceEvent::Press(KC_2)];
static DEMO_REPL_RELEASE: [SequenceEvent; 2] =
    [SequenceEvent::Release(KC_2), SequenceEvent::Release(KC_LSFT)];
static DEMO_REPLACEMENTS: [Replacement; 1] =
    [Replacement::new(KC_REPLACED, &DEMO_REPL_PRESS, &DEMO_REPL_RELEASE)];

fn demo_keymap() -> Vec<Vec<Vec<Keycode>>> {
    vec![
        vec![
            vec![
                Keycode::tap_dance(0),
                Keycode::one_shot_mod(0),
                KC_REPLACED,
                KC_B,
                KC_C,
            ],
            vec![KC_Q, KC_R, KC_S, KC_NO, KC_NO],
        ],
        vec![
            vec![KC_TRNS, KC_TRNS, KC_TRNS, KC_E, KC_F],
            vec![KC_TRNS, KC_TRNS, KC_TRNS, KC_NO, KC_NO],
        ],
    ]
}

fn build_sim() -> Result<Simulator<'static>> {
    let mut exec = Executor::new(SimPlatform::new(demo_keymap()));
    exec.add_physical(PhysicalPipeline::Combo(ComboPipeline::new(&DEMO_COMBOS)))?;
    exec.add_physical(PhysicalPipeline::TapDance(TapDancePipeline::new(
        &DEMO_BEHAVIORS,
    )))?;
    exec.add_virtual(VirtualPipeline::OneShot(OneShotPipeline::new(
        &DEMO_ONE_SHOTS,
    )))?;
    exec.add_virtual(VirtualPipeline::KeyReplacer(KeyReplacerPipeline::new(
        &DEMO_REPLACEMENTS,
    )))?;
    Ok(Simulator::new(exec))
}

fn render(action: &HostAction) -> String {
    match action {
        HostAction::Down(kc) => format!("down {:#06x}", kc.raw()),
        HostAction::Up(kc) => format!("up   {:#06x}", kc.raw()),
        HostAction::Report => "report".into(),
        HostAction::LayerPushed(l) => format!("layer {l} pushed"),
        HostAction::LayerPopped(l) => format!("layer {l} popped"),
        HostAction::LayerSet(l) => format!("layer {l} set"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut log_cfg = ConfigBuilder::new();
    CombinedLogger::init(vec![TermLogger::new(
        level,
        log_cfg.build(),
        TerminalMode::Stderr,
        ColorChoice::AlwaysAnsi,
    )])
    .expect("logger can init");

    let script = std::fs::read_to_string(&args.sim)
        .with_context(|| format!("could not read sim file {:?}", args.sim))?;
    let mut sim = build_sim()?;
    sim.run_script(&script)
        .with_context(|| "sim script failed")?;
    for (t, action) in sim.actions() {
        println!("t:{t} {}", render(action));
    }
    Ok(())
}
