//! Beacon: a small cooperative card game for exercising the actor grid.
//!
//! Players hold hidden cards (values `0..num_values`) that everyone else
//! can see, and build a single pile in ascending order. On its turn a seat
//! may play a card, discard one to regain a hint token, or spend a token to
//! flag one position in the next seat's hand. A misplay costs a life; losing
//! every life zeroes the score. The game ends when the pile is complete, the
//! lives run out, every seat has taken one turn after the deck emptied, or
//! `max_len` steps have elapsed.
//!
//! Action layout for hand size `H`:
//!
//! ```text
//! [0, H)      play position k
//! [H, 2H)     discard position k
//! [2H, 3H)    flag position k of the next seat's hand
//! 3H          pass (the only legal action off turn)
//! ```

use std::sync::Arc;

use super::{Action, GameEnv, GameFactory, LastMove, MoveKind, Observation, Seat, StepResult};

/// Static rules shared by every game a factory creates.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconConfig {
    /// Number of copies of each card value; its length is the number of values.
    pub copies: Vec<usize>,
    pub hand_size: usize,
    pub max_hints: usize,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            copies: vec![3, 3, 2, 2, 2],
            hand_size: 3,
            max_hints: 4,
        }
    }
}

impl BeaconConfig {
    pub fn num_values(&self) -> usize {
        self.copies.len()
    }

    pub fn num_actions(&self) -> usize {
        3 * self.hand_size + 1
    }

    pub fn pass_action(&self) -> Action {
        3 * self.hand_size
    }

    /// Feature length for a game with `num_seats` players.
    pub fn feature_size(&self, num_seats: usize) -> usize {
        let v = self.num_values();
        (v + 1) // pile one-hot
            + 3 // hints, lives, deck remaining
            + (num_seats - 1) * self.hand_size * v // visible hands
            + self.hand_size // own flagged positions
            + self.num_actions() + 1 // last move
            + 1 // on turn
    }

    fn catalog(&self) -> Arc<[MoveKind]> {
        let h = self.hand_size;
        (0..self.num_actions())
            .map(|a| match a / h {
                0 => MoveKind::Play,
                1 => MoveKind::Discard,
                2 => MoveKind::Hint,
                _ => MoveKind::Pass,
            })
            .collect::<Vec<_>>()
            .into()
    }
}

/// Creates [`BeaconGame`]s.
#[derive(Debug, Clone, Default)]
pub struct BeaconFactory {
    pub config: BeaconConfig,
}

impl BeaconFactory {
    pub fn new(config: BeaconConfig) -> Self {
        Self { config }
    }
}

impl GameFactory for BeaconFactory {
    type Game = BeaconGame;

    fn create(
        &self,
        count: usize,
        seed: u64,
        num_seats: usize,
        bomb: usize,
        max_len: usize,
    ) -> Vec<BeaconGame> {
        (0..count)
            .map(|i| {
                BeaconGame::new(
                    self.config.clone(),
                    seed.wrapping_add(i as u64),
                    num_seats,
                    bomb,
                    max_len,
                )
            })
            .collect()
    }
}

/// One Beacon episode plus the RNG used to deal the next one.
#[derive(Debug, Clone)]
pub struct BeaconGame {
    config: BeaconConfig,
    catalog: Arc<[MoveKind]>,
    rng: fastrand::Rng,
    num_seats: usize,
    lives_per_episode: usize,
    max_len: usize,

    deck: Vec<usize>,
    hands: Vec<Vec<Option<usize>>>,
    flagged: Vec<Vec<bool>>,
    pile: usize,
    hints: usize,
    lives: usize,
    current: Seat,
    steps: usize,
    score: f32,
    bombed: bool,
    terminal: bool,
    turns_after_deck: Option<usize>,
    last_move: Option<LastMove>,
}

impl BeaconGame {
    /// # Panics
    ///
    /// Panics if `num_seats < 2` or the hand size is zero.
    pub fn new(
        config: BeaconConfig,
        seed: u64,
        num_seats: usize,
        bomb: usize,
        max_len: usize,
    ) -> Self {
        assert!(num_seats >= 2, "beacon needs at least two seats");
        assert!(config.hand_size > 0, "hand_size must be > 0");
        let catalog = config.catalog();
        let mut game = Self {
            catalog,
            rng: fastrand::Rng::with_seed(seed),
            num_seats,
            lives_per_episode: bomb.max(1),
            max_len,
            deck: Vec::new(),
            hands: Vec::new(),
            flagged: Vec::new(),
            pile: 0,
            hints: config.max_hints,
            lives: bomb.max(1),
            current: 0,
            steps: 0,
            score: 0.0,
            bombed: false,
            terminal: false,
            turns_after_deck: None,
            last_move: None,
            config,
        };
        game.reset();
        game
    }

    fn next_seat(&self, seat: Seat) -> Seat {
        (seat + 1) % self.num_seats
    }

    fn draw(&mut self) -> Option<usize> {
        let card = self.deck.pop();
        if self.deck.is_empty() && self.turns_after_deck.is_none() {
            self.turns_after_deck = Some(self.num_seats);
        }
        card
    }

    fn replace_card(&mut self, seat: Seat, pos: usize) {
        let card = self.draw();
        self.hands[seat][pos] = card;
        self.flagged[seat][pos] = false;
    }

    fn legal_mask(&self, seat: Seat) -> Vec<bool> {
        let h = self.config.hand_size;
        let mut legal = vec![false; self.config.num_actions()];
        if self.terminal || seat != self.current {
            legal[self.config.pass_action()] = true;
            return legal;
        }
        let next = self.next_seat(seat);
        for k in 0..h {
            let has_card = self.hands[seat][k].is_some();
            legal[k] = has_card;
            legal[h + k] = has_card && self.hints < self.config.max_hints;
            legal[2 * h + k] = self.hints > 0 && self.hands[next][k].is_some();
        }
        if !legal.iter().any(|&ok| ok) {
            legal[self.config.pass_action()] = true;
        }
        legal
    }

    fn encode(&self, seat: Seat) -> Vec<f32> {
        let v = self.config.num_values();
        let h = self.config.hand_size;
        let mut features = Vec::with_capacity(self.config.feature_size(self.num_seats));

        let mut pile = vec![0.0; v + 1];
        pile[self.pile] = 1.0;
        features.extend(pile);

        features.push(self.hints as f32 / self.config.max_hints.max(1) as f32);
        features.push(self.lives as f32 / self.lives_per_episode as f32);
        let deck_total: usize = self.config.copies.iter().sum();
        features.push(self.deck.len() as f32 / deck_total.max(1) as f32);

        for offset in 1..self.num_seats {
            let other = (seat + offset) % self.num_seats;
            for k in 0..h {
                let mut one_hot = vec![0.0; v];
                if let Some(card) = self.hands[other][k] {
                    one_hot[card] = 1.0;
                }
                features.extend(one_hot);
            }
        }

        features.extend(self.flagged[seat].iter().map(|&f| if f { 1.0 } else { 0.0 }));

        let mut last = vec![0.0; self.config.num_actions() + 1];
        match self.last_move {
            Some(m) => last[m.action] = 1.0,
            None => last[self.config.num_actions()] = 1.0,
        }
        features.extend(last);

        features.push(if seat == self.current { 1.0 } else { 0.0 });
        features
    }

    fn apply(&mut self, action: Action) -> f32 {
        let h = self.config.hand_size;
        let seat = self.current;
        let mut reward = 0.0;
        match action / h {
            0 => {
                let pos = action;
                if let Some(card) = self.hands[seat][pos] {
                    if card == self.pile {
                        self.pile += 1;
                        self.score += 1.0;
                        reward = 1.0;
                    } else {
                        self.lives -= 1;
                        if self.lives == 0 {
                            reward = -self.score;
                            self.score = 0.0;
                            self.bombed = true;
                            self.terminal = true;
                        }
                    }
                    self.replace_card(seat, pos);
                }
            }
            1 => {
                self.hints = (self.hints + 1).min(self.config.max_hints);
                self.replace_card(seat, action - h);
            }
            2 => {
                let next = self.next_seat(seat);
                self.hints = self.hints.saturating_sub(1);
                self.flagged[next][action - 2 * h] = true;
            }
            _ => {}
        }
        if action != self.config.pass_action() {
            self.last_move = Some(LastMove { seat, action });
        }
        reward
    }
}

impl GameEnv for BeaconGame {
    fn num_seats(&self) -> usize {
        self.num_seats
    }

    fn feature_size(&self, _seat: Seat) -> usize {
        self.config.feature_size(self.num_seats)
    }

    fn num_actions(&self) -> usize {
        self.config.num_actions()
    }

    fn observe(&self, seat: Seat) -> Observation {
        let next = self.next_seat(seat);
        let partner_cues = self.hands[next]
            .iter()
            .enumerate()
            .filter_map(|(k, card)| (*card == Some(self.pile)).then_some(k))
            .collect();
        Observation {
            seat,
            current_seat: self.current,
            features: self.encode(seat),
            legal: self.legal_mask(seat),
            last_move: self.last_move,
            partner_cues,
            catalog: Arc::clone(&self.catalog),
        }
    }

    fn step(&mut self, actions: &[Action]) -> StepResult {
        if self.terminal {
            return StepResult { reward: 0.0, terminal: true };
        }
        let action = actions
            .get(self.current)
            .copied()
            .filter(|&a| self.legal_mask(self.current).get(a).copied().unwrap_or(false))
            .unwrap_or(self.config.pass_action());

        let deck_was_empty = self.turns_after_deck.is_some();
        let reward = self.apply(action);
        self.steps += 1;

        if deck_was_empty {
            if let Some(turns) = self.turns_after_deck.as_mut() {
                *turns = turns.saturating_sub(1);
                if *turns == 0 {
                    self.terminal = true;
                }
            }
        }
        if self.pile == self.config.num_values() || self.steps >= self.max_len {
            self.terminal = true;
        }
        self.current = self.next_seat(self.current);
        StepResult {
            reward,
            terminal: self.terminal,
        }
    }

    fn terminated(&self) -> bool {
        self.terminal
    }

    fn score(&self) -> f32 {
        self.score
    }

    fn max_score(&self) -> f32 {
        self.config.num_values() as f32
    }

    fn bombed(&self) -> bool {
        self.bombed
    }

    fn step_count(&self) -> usize {
        self.steps
    }

    fn reset(&mut self) {
        let mut deck: Vec<usize> = self
            .config
            .copies
            .iter()
            .enumerate()
            .flat_map(|(value, &n)| std::iter::repeat(value).take(n))
            .collect();
        self.rng.shuffle(&mut deck);
        self.deck = deck;
        self.turns_after_deck = None;

        let h = self.config.hand_size;
        self.hands = vec![vec![None; h]; self.num_seats];
        self.flagged = vec![vec![false; h]; self.num_seats];
        for seat in 0..self.num_seats {
            for k in 0..h {
                self.hands[seat][k] = self.draw();
            }
        }

        self.pile = 0;
        self.hints = self.config.max_hints;
        self.lives = self.lives_per_episode;
        self.current = 0;
        self.steps = 0;
        self.score = 0.0;
        self.bombed = false;
        self.terminal = false;
        self.last_move = None;
    }
}
