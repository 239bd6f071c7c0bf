//! Virtual-chain behavior: one-shot modifiers, key replacement, and the two
//! chains composed.

use keyweave_core::combo::{Combo, ComboAction, ComboPipeline};
use keyweave_core::executor::{PhysicalPipeline, VirtualPipeline};
use keyweave_core::key_code::*;
use keyweave_core::key_replacer::{KeyReplacerPipeline, Replacement, SequenceEvent};
use keyweave_core::one_shot::{OneShotModifier, OneShotPipeline};
use keyweave_core::platform::KeyPos;
use keyweave_core::tap_dance::{TapDanceAction, TapDanceBehavior, TapDancePipeline};

use crate::sim::{HostAction::*, Simulator};
use crate::tests::{sim_with, OSM0, OSM1, REPL, TD0};

static ONE_SHOTS: [OneShotModifier; 2] = [
    OneShotModifier::new(OSM0, KC_LSFT),
    OneShotModifier::new(OSM1, KC_LCTL),
];

static REPL_PRESS: [SequenceEvent; 2] =
    [SequenceEvent::Press(KC_LSFT), SequenceEvent::Press(KC_2)];
static REPL_RELEASE: [SequenceEvent; 2] =
    [SequenceEvent::Release(KC_2), SequenceEvent::Release(KC_LSFT)];
static REPLACEMENTS: [Replacement; 1] = [Replacement::new(REPL, &REPL_PRESS, &REPL_RELEASE)];

fn one_shot_sim() -> Simulator<'static> {
    sim_with(
        vec![],
        vec![VirtualPipeline::OneShot(OneShotPipeline::new(&ONE_SHOTS))],
    )
}

#[test]
fn one_shot_wraps_the_next_key() {
    let mut sim = one_shot_sim();
    sim.press(0, 4, 0);
    sim.release(0, 4, 5);
    sim.press(0, 2, 20);
    sim.release(0, 2, 30);
    assert_eq!(
        sim.key_actions(),
        vec![
            (20, Down(KC_LSFT)),
            (20, Down(KC_B)),
            (30, Up(KC_LSFT)),
            (30, Up(KC_B)),
        ]
    );
}

#[test]
fn one_shot_only_lasts_one_key() {
    let mut sim = one_shot_sim();
    sim.run_script("d:0,4 t:5 u:0,4 t:15 d:0,2 t:10 u:0,2 t:10 d:0,3 t:10 u:0,3").unwrap();
    assert_eq!(
        sim.key_actions(),
        vec![
            (20, Down(KC_LSFT)),
            (20, Down(KC_B)),
            (30, Up(KC_LSFT)),
            (30, Up(KC_B)),
            (40, Down(KC_C)),
            (50, Up(KC_C)),
        ]
    );
}

#[test]
fn plain_modifier_clears_the_latch() {
    let mut sim = one_shot_sim();
    sim.press(0, 4, 0);
    sim.release(0, 4, 5);
    sim.press(0, 7, 20);
    sim.press(0, 2, 40);
    sim.release(0, 2, 50);
    sim.release(0, 7, 60);
    assert_eq!(
        sim.key_actions(),
        vec![
            (20, Down(KC_LCTL)),
            (40, Down(KC_B)),
            (50, Up(KC_B)),
            (60, Up(KC_LCTL)),
        ]
    );
}

#[test]
fn newer_one_shot_replaces_the_latch() {
    let mut sim = one_shot_sim();
    sim.press(0, 4, 0);
    sim.release(0, 4, 5);
    sim.press(0, 8, 20);
    sim.release(0, 8, 25);
    sim.press(0, 2, 40);
    sim.release(0, 2, 50);
    assert_eq!(
        sim.key_actions(),
        vec![
            (40, Down(KC_LCTL)),
            (40, Down(KC_B)),
            (50, Up(KC_LCTL)),
            (50, Up(KC_B)),
        ]
    );
}

#[test]
fn replacer_expands_press_and_release_scripts() {
    let mut sim = sim_with(
        vec![],
        vec![VirtualPipeline::KeyReplacer(KeyReplacerPipeline::new(
            &REPLACEMENTS,
        ))],
    );
    sim.press(0, 5, 0);
    sim.release(0, 5, 50);
    // Each burst ends on exactly one report boundary.
    assert_eq!(
        sim.actions(),
        &[
            (0, Down(KC_LSFT)),
            (0, Down(KC_2)),
            (0, Report),
            (50, Up(KC_2)),
            (50, Up(KC_LSFT)),
            (50, Report),
        ]
    );
}

#[test]
fn tap_dance_output_is_wrapped_by_one_shot() {
    static SINGLE_TAP: [TapDanceAction; 1] = [TapDanceAction::tap_key(1, KC_A)];
    static BEHAVIORS: [TapDanceBehavior; 1] = [TapDanceBehavior::new(TD0, &SINGLE_TAP)];
    let mut sim = sim_with(
        vec![PhysicalPipeline::TapDance(TapDancePipeline::new(&BEHAVIORS))],
        vec![VirtualPipeline::OneShot(OneShotPipeline::new(&ONE_SHOTS))],
    );
    sim.press(0, 4, 0);
    sim.release(0, 4, 5);
    sim.press(0, 0, 20);
    sim.release(0, 0, 60);
    assert_eq!(
        sim.key_actions(),
        vec![
            (20, Down(KC_LSFT)),
            (20, Down(KC_A)),
            (60, Up(KC_LSFT)),
            (60, Up(KC_A)),
        ]
    );
}

#[test]
fn combo_output_feeds_the_replacer() {
    static PAIR: [KeyPos; 2] = [KeyPos::new(1, 0), KeyPos::new(1, 1)];
    static COMBOS: [Combo; 1] = [Combo::new(
        &PAIR,
        ComboAction::Register(REPL),
        ComboAction::Unregister(REPL),
    )];
    let mut sim = sim_with(
        vec![PhysicalPipeline::Combo(ComboPipeline::new(&COMBOS))],
        vec![VirtualPipeline::KeyReplacer(KeyReplacerPipeline::new(
            &REPLACEMENTS,
        ))],
    );
    sim.press(1, 0, 0);
    sim.press(1, 1, 10);
    sim.release(1, 0, 70);
    sim.release(1, 1, 80);
    assert_eq!(
        sim.key_actions(),
        vec![
            (60, Down(KC_LSFT)),
            (60, Down(KC_2)),
            (70, Up(KC_2)),
            (70, Up(KC_LSFT)),
        ]
    );
}
