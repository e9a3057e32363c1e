//! Trial plan generation.
//!
//! A plan is a pure function of (config, catalog, counterbalancing group,
//! phase, seed): the same inputs always give the same plan, so a session
//! can be reproduced from the seed written to its log.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Stimulus, MAX_TRAINING_SET};
use crate::config::{CounterbalanceGroup, ExperimentConfig, Phase, PhaseParams};
use crate::error::GenerationError;
use crate::trial::{ChoiceKind, Payload, Side, TrialDescriptor, TrialKind, TrialPlan};

/// Controls per opening block (one from each training class).
const BLOCK_CONTROLS: usize = MAX_TRAINING_SET as usize;
/// Node budget for the constructive placement search.
const PLACEMENT_BUDGET: usize = 10_000;
/// Consecutive failed swaps before a free-choice reorder starts over.
const SEPARATION_RETRIES: usize = 20;

pub struct SequenceGenerator<'a> {
    config: &'a ExperimentConfig,
    phase: Phase,
    seed: u64,
}

impl<'a> SequenceGenerator<'a> {
    pub fn new(config: &'a ExperimentConfig, phase: Phase, seed: u64) -> Self {
        Self {
            config,
            phase,
            seed,
        }
    }

    fn params(&self) -> &PhaseParams {
        self.config.phase(self.phase)
    }

    pub fn generate(
        &self,
        catalog: &Catalog,
        group: CounterbalanceGroup,
    ) -> Result<TrialPlan, GenerationError> {
        self.config.validate()?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let body = match self.phase {
            Phase::Pretraining => {
                vec![(TrialKind::Pretraining, Payload::None, None); self.params().max_trials as usize]
            }
            Phase::Autoshaping => self.autoshaping(&mut rng, catalog, group)?,
            Phase::Choice => self.choice(&mut rng, catalog)?,
        };

        let params = self.params();
        let trials: Vec<TrialDescriptor> = body
            .into_iter()
            .enumerate()
            .map(|(i, (kind, payload, correct_side))| {
                let ratio = rng.gen_range(params.ratio_min..=params.ratio_max);
                let terminal_link_ratio = match params.terminal_link {
                    Some(tl) if kind.is_two_alternative() => Some(rng.gen_range(tl.min..=tl.max)),
                    _ => None,
                };
                TrialDescriptor {
                    index: i as u32 + 1,
                    kind,
                    payload,
                    ratio,
                    correct_side,
                    terminal_link_ratio,
                }
            })
            .collect();

        info!(
            phase = %self.phase,
            seed = self.seed,
            group = group.get(),
            trials = trials.len(),
            "Trial plan generated"
        );

        Ok(TrialPlan {
            phase: self.phase,
            seed: self.seed,
            group: group.get(),
            trials,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Autoshaping
    // ─────────────────────────────────────────────────────────────────────

    fn autoshaping(
        &self,
        rng: &mut StdRng,
        catalog: &Catalog,
        group: CounterbalanceGroup,
    ) -> Result<Vec<PlanEntry>, GenerationError> {
        let design = &self.config.design;
        let pool = catalog.restricted_to_numbers(&design.autoshaping_stimulus_numbers);
        if pool.is_empty() {
            return Err(GenerationError::EmptyPool);
        }
        let max_trials = self.params().max_trials as usize;

        let mut order = opening_section(rng, &pool, group)?;
        let opening = order.len();

        let pool: Vec<Stimulus> = pool.stimuli().to_vec();
        while order.len() < max_trials {
            let prev: Vec<u8> = order
                .iter()
                .rev()
                .take(2)
                .rev()
                .map(|s| s.training_set)
                .collect();
            let pass = constrained_pass(rng, &pool, &prev, design.max_shuffle_attempts)?;
            order.extend(pass);
        }
        order.truncate(max_trials);
        debug!(opening, total = order.len(), "Autoshaping order built");

        Ok(order
            .into_iter()
            .map(|s| {
                let kind = if s.is_probe() {
                    TrialKind::AutoshapingProbe
                } else {
                    TrialKind::AutoshapingControl
                };
                (kind, Payload::Single { stimulus: s }, None)
            })
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Choice
    // ─────────────────────────────────────────────────────────────────────

    fn choice(&self, rng: &mut StdRng, catalog: &Catalog) -> Result<Vec<PlanEntry>, GenerationError> {
        let design = &self.config.design;
        let stimuli: Vec<&Stimulus> = catalog
            .iter()
            .filter(|s| s.is_probe() || s.training_set == design.comparison_class)
            .filter(|s| design.choice_stimulus_numbers.contains(&s.number))
            .collect();
        if stimuli.len() < 2 {
            return Err(GenerationError::TooFewChoiceStimuli {
                found: stimuli.len(),
            });
        }

        let mut pairs: Vec<(usize, usize)> = Vec::new();
        for i in 0..stimuli.len() {
            for j in 0..stimuli.len() {
                if i != j {
                    pairs.push((i, j));
                }
            }
        }
        pairs.shuffle(rng);

        if design.separate_free_choice_stimuli {
            match separate_shared_stimuli(rng, &pairs, design.max_shuffle_attempts) {
                Some(separated) => pairs = separated,
                None => warn!(
                    attempts = design.max_shuffle_attempts,
                    "Could not separate free-choice stimuli; keeping plain shuffle"
                ),
            }
        }

        let mut gaps: Vec<u32> = (0..pairs.len())
            .map(|i| design.gap_sizes[i % design.gap_sizes.len()])
            .collect();
        gaps.shuffle(rng);
        gaps.push(design.trailing_gap);

        let sbe_total: usize = gaps.iter().map(|&g| g as usize).sum();
        let sides = balanced_sides(rng, sbe_total);
        let mut sides = sides.into_iter();

        let mut out = Vec::with_capacity(sbe_total + pairs.len());
        let mut pairs = pairs.into_iter();
        for gap in gaps {
            for _ in 0..gap {
                let mut palette = design.sbe_palette.clone();
                let left = palette.remove(rng.gen_range(0..palette.len()));
                let right = palette.remove(rng.gen_range(0..palette.len()));
                out.push((
                    TrialKind::SideBiasElimination,
                    Payload::Colors { left, right },
                    sides.next(),
                ));
            }
            if let Some((l, r)) = pairs.next() {
                let (left, right) = (stimuli[l].clone(), stimuli[r].clone());
                let kind = TrialKind::FreeChoice(ChoiceKind::classify(&left, &right));
                out.push((kind, Payload::Pair { left, right }, None));
            }
        }

        let max_trials = self.params().max_trials as usize;
        if out.len() > max_trials {
            warn!(
                planned = out.len(),
                max_trials, "Choice plan exceeds the trial limit; truncating"
            );
            out.truncate(max_trials);
        }
        Ok(out)
    }
}

type PlanEntry = (TrialKind, Payload, Option<Side>);

/// Opening blocks: five controls (one per class, drawn without replacement)
/// followed by the next probe of the group's order. The two bookend probes
/// are mandatory; later order entries get a block only when their probe is
/// in the pool.
fn opening_section(
    rng: &mut StdRng,
    pool: &Catalog,
    group: CounterbalanceGroup,
) -> Result<Vec<Stimulus>, GenerationError> {
    let order = group.probe_order();
    let mut probes = Vec::with_capacity(order.len());
    for (k, &number) in order.iter().enumerate() {
        match pool.find_probe(number) {
            Some(p) => probes.push(p.clone()),
            None if k < 2 => return Err(GenerationError::MissingProbe { number }),
            None => {}
        }
    }

    let blocks = probes.len();
    let mut by_class: Vec<Vec<Stimulus>> = Vec::with_capacity(BLOCK_CONTROLS);
    for class in 1..=MAX_TRAINING_SET {
        let mut controls: Vec<Stimulus> =
            pool.by_training_set(class).into_iter().cloned().collect();
        if controls.len() < blocks {
            return Err(GenerationError::InsufficientClass {
                class,
                available: controls.len(),
                needed: blocks,
            });
        }
        controls.shuffle(rng);
        controls.truncate(blocks);
        by_class.push(controls);
    }

    let mut out = Vec::with_capacity(blocks * (BLOCK_CONTROLS + 1));
    for probe in probes {
        let mut classes: Vec<usize> = (0..BLOCK_CONTROLS).collect();
        classes.shuffle(rng);
        for c in classes {
            if let Some(s) = by_class[c].pop() {
                out.push(s);
            }
        }
        out.push(probe);
    }
    Ok(out)
}

/// One shuffled pass over the pool with no three consecutive entries of the
/// same training class, counting the two trials before the pass.
fn constrained_pass(
    rng: &mut StdRng,
    pool: &[Stimulus],
    prev: &[u8],
    attempts: usize,
) -> Result<Vec<Stimulus>, GenerationError> {
    let mut pass = pool.to_vec();
    for _ in 0..attempts {
        pass.shuffle(rng);
        let classes: Vec<u8> = prev
            .iter()
            .copied()
            .chain(pass.iter().map(|s| s.training_set))
            .collect();
        if !has_triple_run(&classes) {
            return Ok(pass);
        }
    }

    warn!(attempts, "Shuffle cap reached; trying constructive placement");
    constructive_pass(rng, pool, prev).ok_or(GenerationError::Unsatisfiable { attempts })
}

/// Randomized depth-first placement of classes with feasibility pruning,
/// then stimuli assigned per class in shuffled order.
fn constructive_pass(rng: &mut StdRng, pool: &[Stimulus], prev: &[u8]) -> Option<Vec<Stimulus>> {
    let mut groups: Vec<(u8, Vec<Stimulus>)> = Vec::new();
    for s in pool {
        match groups.iter_mut().find(|(c, _)| *c == s.training_set) {
            Some((_, v)) => v.push(s.clone()),
            None => groups.push((s.training_set, vec![s.clone()])),
        }
    }
    let mut counts: Vec<(u8, usize)> = groups.iter().map(|(c, v)| (*c, v.len())).collect();
    let mut history = prev.to_vec();
    let mut budget = PLACEMENT_BUDGET;

    if !class_counts_feasible(&counts, &history)
        || !place_classes(rng, &mut counts, &mut history, pool.len(), &mut budget)
    {
        return None;
    }

    for (_, v) in groups.iter_mut() {
        v.shuffle(rng);
    }
    let mut out = Vec::with_capacity(pool.len());
    for class in &history[prev.len()..] {
        let (_, v) = groups.iter_mut().find(|(c, _)| c == class)?;
        out.push(v.pop()?);
    }
    Some(out)
}

fn place_classes(
    rng: &mut StdRng,
    counts: &mut [(u8, usize)],
    history: &mut Vec<u8>,
    left: usize,
    budget: &mut usize,
) -> bool {
    if left == 0 {
        return true;
    }
    if *budget == 0 {
        return false;
    }
    *budget -= 1;

    let mut options: Vec<usize> = (0..counts.len())
        .filter(|&i| counts[i].1 > 0 && !closes_triple(history, counts[i].0))
        .collect();
    options.shuffle(rng);

    for i in options {
        counts[i].1 -= 1;
        history.push(counts[i].0);
        if class_counts_feasible(counts, history)
            && place_classes(rng, counts, history, left - 1, budget)
        {
            return true;
        }
        history.pop();
        counts[i].1 += 1;
    }
    false
}

fn closes_triple<T: PartialEq>(history: &[T], next: T) -> bool {
    let n = history.len();
    n >= 2 && history[n - 1] == next && history[n - 2] == next
}

/// Every class must fit into the slots the other classes leave open: runs of
/// at most two, each run separated by at least one other item.
fn class_counts_feasible(counts: &[(u8, usize)], history: &[u8]) -> bool {
    let total: usize = counts.iter().map(|(_, n)| n).sum();
    let tail = history.last().copied();
    let run = history
        .iter()
        .rev()
        .take_while(|&&c| Some(c) == tail)
        .count()
        .min(2);
    counts.iter().all(|&(class, n)| {
        let slack = if Some(class) == tail { 2 - run } else { 2 };
        n <= slack + 2 * (total - n)
    })
}

/// Reorder free-choice pairs so that consecutive pairs share no stimulus.
fn separate_shared_stimuli(
    rng: &mut StdRng,
    pairs: &[(usize, usize)],
    attempts: usize,
) -> Option<Vec<(usize, usize)>> {
    let shares = |a: (usize, usize), b: (usize, usize)| {
        a.0 == b.0 || a.0 == b.1 || a.1 == b.0 || a.1 == b.1
    };

    'attempt: for _ in 0..attempts {
        let mut rest = pairs.to_vec();
        rest.shuffle(rng);
        let mut out = Vec::with_capacity(pairs.len());
        let mut retries = 0;
        while rest.len() > 1 {
            if retries > SEPARATION_RETRIES {
                continue 'attempt;
            }
            if shares(rest[0], rest[1]) {
                let head = rest.remove(0);
                rest.shuffle(rng);
                rest.insert(0, head);
                retries += 1;
            } else {
                out.push(rest.remove(0));
                retries = 0;
            }
        }
        out.extend(rest);
        return Some(out);
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Random left/right sequence with equal counts (±1) and no run longer than
/// two.
pub fn balanced_sides<R: Rng + ?Sized>(rng: &mut R, n: usize) -> Vec<Side> {
    let mut out: Vec<Side> = Vec::with_capacity(n);
    let (mut lefts, mut rights) = (0i64, 0i64);

    for i in 0..n {
        let remaining = (n - i - 1) as i64;
        let options: Vec<Side> = [Side::Left, Side::Right]
            .into_iter()
            .filter(|&side| {
                let run = trailing_run(&out, side) + 1;
                let diff = match side {
                    Side::Left => lefts + 1 - rights,
                    Side::Right => lefts - rights - 1,
                };
                run <= 2 && can_finish(diff, side, run, remaining)
            })
            .collect();

        let side = options.choose(rng).copied().unwrap_or(Side::Left);
        match side {
            Side::Left => lefts += 1,
            Side::Right => rights += 1,
        }
        out.push(side);
    }
    out
}

fn trailing_run(seq: &[Side], side: Side) -> i64 {
    seq.iter().rev().take_while(|&&s| s == side).count() as i64
}

/// Whether `remaining` more sides can follow a tail run of `run` × `tail`
/// and end with |lefts - rights| ≤ 1, given the current `diff`.
fn can_finish(diff: i64, tail: Side, run: i64, remaining: i64) -> bool {
    (0..=remaining).any(|x| {
        let y = remaining - x;
        if (diff + x - y).abs() > 1 {
            return false;
        }
        let left_cap = 2 * (y + 1) - if tail == Side::Left { run } else { 0 };
        let right_cap = 2 * (x + 1) - if tail == Side::Right { run } else { 0 };
        x <= left_cap && y <= right_cap
    })
}

/// True if any three consecutive items are equal.
pub fn has_triple_run<T: PartialEq>(items: &[T]) -> bool {
    items.windows(3).any(|w| w[0] == w[1] && w[1] == w[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::{HashMap, HashSet};

    fn group(g: u8) -> CounterbalanceGroup {
        CounterbalanceGroup::new(g).unwrap()
    }

    fn plan(cfg: &ExperimentConfig, phase: Phase, seed: u64, g: u8) -> TrialPlan {
        SequenceGenerator::new(cfg, phase, seed)
            .generate(&Catalog::builtin_gradient_set(), group(g))
            .unwrap()
    }

    fn stimulus(t: &TrialDescriptor) -> &Stimulus {
        t.payload.center().unwrap()
    }

    #[test]
    fn pretraining_plan() {
        let cfg = ExperimentConfig::default();
        let p = plan(&cfg, Phase::Pretraining, 3, 1);
        assert_eq!(p.len(), 90);
        for (i, t) in p.iter().enumerate() {
            assert_eq!(t.index as usize, i + 1);
            assert_eq!(t.kind, TrialKind::Pretraining);
            assert_eq!(t.payload, Payload::None);
            assert!((3..=7).contains(&t.ratio));
        }
    }

    #[test]
    fn plans_are_deterministic_per_seed() {
        let cfg = ExperimentConfig::default();
        for phase in Phase::ALL {
            assert_eq!(plan(&cfg, phase, 42, 2), plan(&cfg, phase, 42, 2));
        }
        assert_ne!(
            plan(&cfg, Phase::Autoshaping, 1, 1),
            plan(&cfg, Phase::Autoshaping, 2, 1)
        );
    }

    #[test]
    fn autoshaping_opening_blocks_follow_group_order() {
        let cfg = ExperimentConfig::default();
        for g in 1..=4 {
            let p = plan(&cfg, Phase::Autoshaping, 7 + g as u64, g);
            assert_eq!(p.len(), 84);

            let [first, second] = group(g).bookends();
            assert_eq!(p.get(6).unwrap().kind, TrialKind::AutoshapingProbe);
            assert_eq!(stimulus(p.get(6).unwrap()).number, first);
            assert_eq!(p.get(12).unwrap().kind, TrialKind::AutoshapingProbe);
            assert_eq!(stimulus(p.get(12).unwrap()).number, second);

            let mut names = HashSet::new();
            for block in [1..=5u32, 7..=11] {
                let classes: HashSet<u8> =
                    block.clone().map(|i| stimulus(p.get(i).unwrap()).training_set).collect();
                assert_eq!(classes.len(), 5);
                assert!(!classes.contains(&0));
                for i in block {
                    assert!(names.insert(stimulus(p.get(i).unwrap()).name.clone()));
                }
            }
        }
    }

    #[test]
    fn autoshaping_respects_class_repetition_and_ratios() {
        let cfg = ExperimentConfig::default();
        for seed in 0..25 {
            let p = plan(&cfg, Phase::Autoshaping, seed, 1 + (seed % 4) as u8);
            let classes: Vec<u8> = p.iter().map(|t| stimulus(t).training_set).collect();
            assert!(!has_triple_run(&classes), "seed {seed}");
            assert!(p.iter().all(|t| (7..=12).contains(&t.ratio)));
            assert!(p.iter().all(|t| [1, 5].contains(&stimulus(t).number)));

            // Each fill pass is a permutation of the 12-stimulus pool.
            for pass in p.trials[12..].chunks(12) {
                let names: HashSet<&str> =
                    pass.iter().map(|t| stimulus(t).name.as_str()).collect();
                assert_eq!(names.len(), 12);
            }
        }
    }

    #[test]
    fn full_pool_opening_shows_every_probe_in_order() {
        let mut cfg = ExperimentConfig::default();
        cfg.design.autoshaping_stimulus_numbers = vec![1, 2, 3, 4, 5];
        let p = plan(&cfg, Phase::Autoshaping, 11, 2);
        assert_eq!(p.len(), 84);
        let probes: Vec<u8> = [6, 12, 18, 24, 30]
            .iter()
            .map(|&i| stimulus(p.get(i).unwrap()).number)
            .collect();
        assert_eq!(probes, vec![1, 5, 4, 3, 2]);

        // No control repeats anywhere in the opening section.
        let names: HashSet<&str> = p.trials[..30]
            .iter()
            .map(|t| stimulus(t).name.as_str())
            .collect();
        assert_eq!(names.len(), 30);
    }

    #[test]
    fn autoshaping_missing_stimuli_are_reported() {
        let cfg = ExperimentConfig::default();
        let no_probe5: Vec<Stimulus> = Catalog::builtin_gradient_set()
            .iter()
            .filter(|s| s.name != "Probe5.jpg")
            .cloned()
            .collect();
        let cat = Catalog::from_stimuli(no_probe5).unwrap();
        let err = SequenceGenerator::new(&cfg, Phase::Autoshaping, 1)
            .generate(&cat, group(1))
            .unwrap_err();
        assert!(matches!(err, GenerationError::MissingProbe { number: 5 }));

        let thin_class: Vec<Stimulus> = Catalog::builtin_gradient_set()
            .iter()
            .filter(|s| s.name != "Set3_Stim5.jpg")
            .cloned()
            .collect();
        let cat = Catalog::from_stimuli(thin_class).unwrap();
        let err = SequenceGenerator::new(&cfg, Phase::Autoshaping, 1)
            .generate(&cat, group(1))
            .unwrap_err();
        assert!(matches!(
            err,
            GenerationError::InsufficientClass {
                class: 3,
                available: 1,
                needed: 2
            }
        ));
    }

    #[test]
    fn constructive_fallback_keeps_constraint() {
        let mut cfg = ExperimentConfig::default();
        cfg.design.max_shuffle_attempts = 1;
        for seed in 0..30 {
            let p = plan(&cfg, Phase::Autoshaping, seed, 3);
            let classes: Vec<u8> = p.iter().map(|t| stimulus(t).training_set).collect();
            assert_eq!(p.len(), 84);
            assert!(!has_triple_run(&classes), "seed {seed}");
        }
    }

    #[test]
    fn unsatisfiable_pass_is_an_error() {
        let pool: Vec<Stimulus> = (1..=3)
            .map(|n| Stimulus::new(format!("s{n}"), 1, n))
            .collect();
        let mut rng = StdRng::seed_from_u64(0);
        let err = constrained_pass(&mut rng, &pool, &[], 50).unwrap_err();
        assert!(matches!(err, GenerationError::Unsatisfiable { attempts: 50 }));
    }

    #[test]
    fn constructive_pass_honours_preceding_trials() {
        // Class 1 x4, class 2 x2: only 1 1 2 1 1 2 style orders fit, and the
        // tail [1, 1] forces the pass to open with class 2.
        let pool: Vec<Stimulus> = (0..6)
            .map(|i| Stimulus::new(format!("s{i}"), if i < 4 { 1 } else { 2 }, 1))
            .collect();
        let mut rng = StdRng::seed_from_u64(5);
        let pass = constructive_pass(&mut rng, &pool, &[1, 1]).unwrap();
        let classes: Vec<u8> = [1, 1]
            .into_iter()
            .chain(pass.iter().map(|s| s.training_set))
            .collect();
        assert!(!has_triple_run(&classes));
        assert_eq!(pass.len(), 6);
    }

    #[test]
    fn choice_plan_structure() {
        let cfg = ExperimentConfig::default();
        for seed in 0..10 {
            let p = plan(&cfg, Phase::Choice, seed, 1);
            assert_eq!(p.len(), 80);
            assert!(p.iter().all(|t| t.ratio == 10));

            let free: Vec<&TrialDescriptor> = p
                .iter()
                .filter(|t| matches!(t.kind, TrialKind::FreeChoice(_)))
                .collect();
            assert_eq!(free.len(), 12);
            let pairs: HashSet<(&str, &str)> = free
                .iter()
                .map(|t| (t.payload.left().unwrap().name.as_str(), t.payload.right().unwrap().name.as_str()))
                .collect();
            assert_eq!(pairs.len(), 12);

            let mut kinds: HashMap<&str, usize> = HashMap::new();
            for t in &free {
                *kinds.entry(t.kind.label()).or_default() += 1;
            }
            assert_eq!(kinds["PvP"], 2);
            assert_eq!(kinds["CvC"], 2);
            assert_eq!(kinds["PvC"], 8);

            // SBE runs between free-choice trials use each gap size 3 times.
            let mut gaps = Vec::new();
            let mut run = 0;
            for t in p.iter() {
                if t.kind == TrialKind::SideBiasElimination {
                    run += 1;
                } else {
                    gaps.push(run);
                    run = 0;
                }
            }
            assert_eq!(run, 2);
            gaps.sort_unstable();
            assert_eq!(gaps, vec![4, 4, 4, 5, 5, 5, 6, 6, 6, 7, 7, 7]);

            let sbe: Vec<&TrialDescriptor> = p
                .iter()
                .filter(|t| t.kind == TrialKind::SideBiasElimination)
                .collect();
            assert_eq!(sbe.len(), 68);
            let sides: Vec<Side> = sbe.iter().map(|t| t.correct_side.unwrap()).collect();
            let lefts = sides.iter().filter(|&&s| s == Side::Left).count();
            assert_eq!(lefts, 34);
            assert!(!has_triple_run(&sides));
            for t in sbe {
                let (l, r) = t.payload.colors().unwrap();
                assert_ne!(l, r);
                assert!(cfg.design.sbe_palette.iter().any(|c| c == l));
            }
            assert!(free.iter().all(|t| t.correct_side.is_none()));
        }
    }

    #[test]
    fn separated_free_choices_share_no_stimulus() {
        let mut cfg = ExperimentConfig::default();
        cfg.design.separate_free_choice_stimuli = true;
        for seed in 0..10 {
            let p = plan(&cfg, Phase::Choice, seed, 4);
            let free: Vec<(&str, &str)> = p
                .iter()
                .filter_map(|t| match &t.payload {
                    Payload::Pair { left, right } => Some((left.name.as_str(), right.name.as_str())),
                    _ => None,
                })
                .collect();
            assert_eq!(free.len(), 12);
            for w in free.windows(2) {
                let (a, b) = (w[0], w[1]);
                assert!(a.0 != b.0 && a.0 != b.1 && a.1 != b.0 && a.1 != b.1);
            }
        }
    }

    #[test]
    fn choice_needs_two_stimuli() {
        let cfg = ExperimentConfig::default();
        let cat = Catalog::from_stimuli(vec![Stimulus::new("Probe1.jpg", 0, 1)]).unwrap();
        let err = SequenceGenerator::new(&cfg, Phase::Choice, 0)
            .generate(&cat, group(1))
            .unwrap_err();
        assert!(matches!(err, GenerationError::TooFewChoiceStimuli { found: 1 }));
    }

    #[test]
    fn terminal_link_requirement_drawn_per_trial() {
        let mut cfg = ExperimentConfig::default();
        assert!(plan(&cfg, Phase::Choice, 5, 1)
            .iter()
            .all(|t| t.terminal_link_ratio.is_none()));

        cfg.choice.terminal_link = Some(crate::config::RatioRange::terminal_link());
        let p = plan(&cfg, Phase::Choice, 5, 1);
        let ratios: HashSet<u32> = p.iter().map(|t| t.terminal_link_ratio.unwrap()).collect();
        assert!(ratios.iter().all(|r| (7..=12).contains(r)));
        assert!(ratios.len() > 1);
    }

    #[test]
    fn unvalidated_config_is_rejected_not_panicking() {
        let mut cfg = ExperimentConfig::default();
        cfg.design.gap_sizes.clear();
        let err = SequenceGenerator::new(&cfg, Phase::Choice, 0)
            .generate(&Catalog::builtin_gradient_set(), group(1))
            .unwrap_err();
        assert!(matches!(err, GenerationError::Config(_)));

        let mut cfg = ExperimentConfig::default();
        cfg.pretraining.ratio_min = 9;
        assert!(SequenceGenerator::new(&cfg, Phase::Pretraining, 0)
            .generate(&Catalog::builtin_gradient_set(), group(1))
            .is_err());
    }

    #[test]
    fn balanced_sides_properties() {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            for n in 0..90 {
                let s = balanced_sides(&mut rng, n);
                assert_eq!(s.len(), n);
                let lefts = s.iter().filter(|&&x| x == Side::Left).count() as i64;
                assert!((2 * lefts - n as i64).abs() <= 1);
                assert!(!has_triple_run(&s));
            }
        }
        let a = balanced_sides(&mut StdRng::seed_from_u64(9), 68);
        let b = balanced_sides(&mut StdRng::seed_from_u64(9), 68);
        assert_eq!(a, b);
    }
}
