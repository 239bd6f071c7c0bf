//! Tap-dance behavior: basic taps and holds, hold-interruption strategies,
//! multi-tap sequences, overflow, and immediate vs. deferred emission.

use keyweave_core::executor::PhysicalPipeline;
use keyweave_core::key_code::*;
use keyweave_core::tap_dance::{
    HoldStrategy, TapDanceAction, TapDanceBehavior, TapDancePipeline,
};

use crate::sim::{HostAction::*, Simulator};
use crate::tests::{sim_with, TD0, TD1};

static TAP_HOLD: [TapDanceAction; 2] = [
    TapDanceAction::tap_key(1, KC_A),
    TapDanceAction::hold_layer(1, 1, HoldStrategy::TapPreferred),
];
static TAP_HOLD_HOLDPREF: [TapDanceAction; 2] = [
    TapDanceAction::tap_key(1, KC_A),
    TapDanceAction::hold_layer(1, 1, HoldStrategy::HoldPreferred),
];
static TAP_HOLD_BALANCED: [TapDanceAction; 2] = [
    TapDanceAction::tap_key(1, KC_A),
    TapDanceAction::hold_layer(1, 1, HoldStrategy::Balanced),
];
static MULTI: [TapDanceAction; 2] = [
    TapDanceAction::tap_key(1, KC_A),
    TapDanceAction::tap_key(2, KC_D),
];
static MULTI_HOLD4: [TapDanceAction; 3] = [
    TapDanceAction::tap_key(1, KC_A),
    TapDanceAction::tap_key(2, KC_D),
    TapDanceAction::hold_layer(4, 1, HoldStrategy::TapPreferred),
];
static TAP_HOLD_MULTI: [TapDanceAction; 3] = [
    TapDanceAction::tap_key(1, KC_A),
    TapDanceAction::hold_layer(1, 1, HoldStrategy::TapPreferred),
    TapDanceAction::tap_key(2, KC_D),
];
static HOLD_ONLY: [TapDanceAction; 1] =
    [TapDanceAction::hold_layer(1, 1, HoldStrategy::TapPreferred)];
static HOLD_KEY: [TapDanceAction; 2] = [
    TapDanceAction::tap_key(1, KC_A),
    TapDanceAction::hold_key(1, KC_LSFT, HoldStrategy::TapPreferred),
];
static SINGLE_TAP: [TapDanceAction; 1] = [TapDanceAction::tap_key(1, KC_A)];
static SINGLE_TAP_G: [TapDanceAction; 1] = [TapDanceAction::tap_key(1, KC_G)];

/// One behavior on TD0 with the default 200ms timeouts. Leaking the behavior
/// array gives it the 'static lifetime the executor borrows.
fn td(actions: &'static [TapDanceAction]) -> Simulator<'static> {
    let behaviors: &'static [TapDanceBehavior<'static>] =
        Box::leak(Box::new([TapDanceBehavior::new(TD0, actions)]));
    sim_with(
        vec![PhysicalPipeline::TapDance(TapDancePipeline::new(behaviors))],
        vec![],
    )
}

#[test]
fn simple_tap() {
    let mut sim = td(&TAP_HOLD);
    sim.press(0, 0, 0);
    sim.release(0, 0, 150);
    assert_eq!(sim.key_actions(), vec![(150, Down(KC_A)), (150, Up(KC_A))]);
}

#[test]
fn simple_hold() {
    let mut sim = td(&TAP_HOLD);
    sim.press(0, 0, 0);
    sim.release(0, 0, 250);
    assert_eq!(
        sim.key_actions(),
        vec![(200, LayerPushed(1)), (250, LayerPopped(1))]
    );
}

#[test]
fn release_one_ms_before_timeout_is_a_tap() {
    let mut sim = td(&TAP_HOLD);
    sim.press(0, 0, 0);
    sim.release(0, 0, 199);
    assert_eq!(sim.key_actions(), vec![(199, Down(KC_A)), (199, Up(KC_A))]);
}

#[test]
fn release_exactly_at_timeout_is_a_hold() {
    let mut sim = td(&TAP_HOLD);
    sim.press(0, 0, 0);
    sim.release(0, 0, 200);
    assert_eq!(
        sim.key_actions(),
        vec![(200, LayerPushed(1)), (200, LayerPopped(1))]
    );
}

#[test]
fn rolled_overlap_tap_preferred() {
    // The interrupting key is deferred behind the decision and replays
    // unchanged, wrapped by the tap output.
    let mut sim = td(&TAP_HOLD);
    sim.press(0, 0, 0);
    sim.press(0, 2, 110);
    sim.release(0, 2, 120);
    sim.release(0, 0, 199);
    assert_eq!(
        sim.key_actions(),
        vec![
            (199, Down(KC_A)),
            (199, Down(KC_B)),
            (199, Up(KC_B)),
            (199, Up(KC_A)),
        ]
    );
}

#[test]
fn rolled_overlap_hold_preferred() {
    // The first interrupting press commits the hold and is reprocessed under
    // the activated layer: B on layer 1 is X.
    let mut sim = td(&TAP_HOLD_HOLDPREF);
    sim.press(0, 0, 0);
    sim.press(0, 2, 110);
    sim.release(0, 2, 120);
    sim.release(0, 0, 199);
    assert_eq!(
        sim.key_actions(),
        vec![
            (110, LayerPushed(1)),
            (110, Down(KC_X)),
            (120, Up(KC_X)),
            (199, LayerPopped(1)),
        ]
    );
}

#[test]
fn balanced_commits_on_complete_interrupt_cycle() {
    let mut sim = td(&TAP_HOLD_BALANCED);
    sim.press(0, 0, 0);
    sim.press(0, 2, 50);
    sim.release(0, 2, 80);
    sim.release(0, 0, 150);
    assert_eq!(
        sim.key_actions(),
        vec![
            (80, LayerPushed(1)),
            (80, Down(KC_X)),
            (80, Up(KC_X)),
            (150, LayerPopped(1)),
        ]
    );
}

#[test]
fn balanced_trigger_release_before_cycle_is_a_tap() {
    let mut sim = td(&TAP_HOLD_BALANCED);
    sim.press(0, 0, 0);
    sim.press(0, 2, 50);
    sim.release(0, 0, 100);
    sim.release(0, 2, 150);
    assert_eq!(
        sim.key_actions(),
        vec![
            (100, Down(KC_A)),
            (100, Down(KC_B)),
            (100, Up(KC_A)),
            (150, Up(KC_B)),
        ]
    );
}

#[test]
fn tap_preferred_interrupt_still_held_at_resolution() {
    let mut sim = td(&TAP_HOLD);
    sim.press(0, 0, 0);
    sim.press(0, 2, 50);
    sim.release(0, 0, 100);
    sim.release(0, 2, 150);
    assert_eq!(
        sim.key_actions(),
        vec![
            (100, Down(KC_A)),
            (100, Down(KC_B)),
            (100, Up(KC_A)),
            (150, Up(KC_B)),
        ]
    );
}

#[test]
fn double_tap_resolves_second_action_immediately() {
    // At count 2 nothing is left to decide, so emission happens at the press
    // timestamp rather than at a timeout.
    let mut sim = td(&MULTI);
    sim.press(0, 0, 0);
    sim.release(0, 0, 50);
    sim.press(0, 0, 100);
    sim.release(0, 0, 150);
    assert_eq!(sim.key_actions(), vec![(100, Down(KC_D)), (150, Up(KC_D))]);
}

#[test]
fn single_tap_resolves_on_tap_timeout() {
    let mut sim = td(&MULTI);
    sim.press(0, 0, 0);
    sim.release(0, 0, 50);
    sim.advance_to(400);
    assert_eq!(sim.key_actions(), vec![(250, Down(KC_A)), (250, Up(KC_A))]);
}

#[test]
fn taps_separated_by_tap_timeout_start_fresh_sequences() {
    let mut sim = td(&MULTI);
    sim.press(0, 0, 0);
    sim.release(0, 0, 50);
    sim.press(0, 0, 300);
    sim.release(0, 0, 350);
    sim.advance_to(600);
    assert_eq!(
        sim.key_actions(),
        vec![
            (250, Down(KC_A)),
            (250, Up(KC_A)),
            (550, Down(KC_A)),
            (550, Up(KC_A)),
        ]
    );
}

#[test]
fn tap_count_overflow_falls_back_to_highest_tap() {
    // Three taps with actions configured at counts 1, 2 and a hold at 4:
    // count 3 resolves to the highest configured tap action.
    let mut sim = td(&MULTI_HOLD4);
    sim.run_script("d:0,0 t:20 u:0,0 t:20 d:0,0 t:20 u:0,0 t:20 d:0,0 t:20 u:0,0").unwrap();
    sim.advance_to(500);
    assert_eq!(sim.key_actions(), vec![(300, Down(KC_D)), (300, Up(KC_D))]);
}

#[test]
fn hold_beyond_highest_configured_hold_degrades_to_tap() {
    let mut sim = td(&TAP_HOLD_MULTI);
    sim.press(0, 0, 0);
    sim.release(0, 0, 100);
    sim.press(0, 0, 150);
    sim.release(0, 0, 500);
    assert_eq!(sim.key_actions(), vec![(150, Down(KC_D)), (500, Up(KC_D))]);
}

#[test]
fn tap_on_hold_only_config_produces_nothing() {
    let mut sim = td(&HOLD_ONLY);
    sim.press(0, 0, 0);
    sim.release(0, 0, 100);
    sim.advance_to(500);
    assert!(sim.key_actions().is_empty());
    match &sim.executor().physical_pipelines()[0] {
        PhysicalPipeline::TapDance(td) => assert!(td.is_quiescent()),
        _ => unreachable!(),
    }
}

#[test]
fn hold_action_can_register_a_key() {
    let mut sim = td(&HOLD_KEY);
    sim.press(0, 0, 0);
    sim.release(0, 0, 350);
    assert_eq!(
        sim.key_actions(),
        vec![(200, Down(KC_LSFT)), (350, Up(KC_LSFT))]
    );
}

#[test]
fn determined_single_tap_bypasses_at_original_timestamps() {
    let mut sim = td(&SINGLE_TAP);
    sim.press(0, 0, 5);
    sim.release(0, 0, 80);
    assert_eq!(sim.key_actions(), vec![(5, Down(KC_A)), (80, Up(KC_A))]);
}

#[test]
fn other_keys_pass_through_while_waiting_for_tap() {
    let mut sim = td(&MULTI);
    sim.press(0, 0, 0);
    sim.release(0, 0, 10);
    sim.press(0, 2, 50);
    sim.release(0, 2, 60);
    sim.advance_to(400);
    assert_eq!(
        sim.key_actions(),
        vec![
            (50, Down(KC_B)),
            (60, Up(KC_B)),
            (210, Down(KC_A)),
            (210, Up(KC_A)),
        ]
    );
}

#[test]
fn behaviors_run_independently() {
    static TWO: [TapDanceBehavior; 2] = [
        TapDanceBehavior::new(TD0, &TAP_HOLD),
        TapDanceBehavior::new(TD1, &SINGLE_TAP_G),
    ];
    let mut sim = sim_with(
        vec![PhysicalPipeline::TapDance(TapDancePipeline::new(&TWO))],
        vec![],
    );
    sim.press(0, 0, 0);
    sim.release(0, 0, 50);
    sim.press(0, 1, 100);
    sim.release(0, 1, 130);
    assert_eq!(
        sim.key_actions(),
        vec![
            (50, Down(KC_A)),
            (50, Up(KC_A)),
            (100, Down(KC_G)),
            (130, Up(KC_G)),
        ]
    );
    assert!(!sim.executor().is_capturing());
    assert!(sim.executor().scheduler().is_empty());
}
