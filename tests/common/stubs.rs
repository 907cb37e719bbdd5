//! Game stubs implementing `SessionCallbacks` for integration tests.
//!
//! The session owns its callbacks, so the stub keeps its state behind shared handles:
//! the test loop simulates frames on the same state the session saves, loads and
//! replays.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use rollback_session::{
    CallbackError, Event, EventCode, Frame, SaveBuffer, SessionCallbacks, SyncedInputs,
};

/// The simulated game: a frame counter and a value folded from every input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateStub {
    pub frame: i32,
    pub value: i64,
}

impl StateStub {
    pub fn advance(&mut self, inputs: &SyncedInputs) {
        assert_eq!(inputs.frame.as_i32(), self.frame, "inputs for the wrong frame");
        for (index, input) in inputs.inputs.iter().enumerate() {
            self.value = self
                .value
                .wrapping_mul(31)
                .wrapping_add(input.wrapping_mul(index as i64 + 7));
        }
        self.frame += 1;
    }

    pub fn checksum(&self) -> u64 {
        (self.value as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ self.frame as u64
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut bytes = self.frame.to_le_bytes().to_vec();
        bytes.extend_from_slice(&self.value.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CallbackError> {
        if bytes.len() != 12 {
            return Err(CallbackError::new(format!("{} byte snapshot", bytes.len())));
        }
        Ok(Self {
            frame: i32::from_le_bytes(bytes[..4].try_into().unwrap()),
            value: i64::from_le_bytes(bytes[4..].try_into().unwrap()),
        })
    }
}

/// Everything the session asked the stub to do.
#[derive(Debug, Default)]
pub struct StubLog {
    pub began: Vec<String>,
    pub saves: usize,
    pub loads: usize,
    pub frees: usize,
    pub replayed: usize,
    pub events: Vec<Event>,
    pub logged: Vec<String>,
    /// Checksum of the newest snapshot per frame.
    pub history: BTreeMap<i32, u64>,
}

impl StubLog {
    pub fn count(&self, code: EventCode) -> usize {
        self.events.iter().filter(|event| event.code() == code).count()
    }
}

#[derive(Clone, Default)]
pub struct GameStub {
    pub state: Rc<RefCell<StateStub>>,
    pub log: Rc<RefCell<StubLog>>,
    /// Reports a wrong checksum from this frame on, as if the game desynced.
    corrupt_from: Option<i32>,
    /// While set, `advance_frame` (replays) fails.
    fail_advance: Rc<Cell<bool>>,
    /// While set, `load_game_state` fails.
    fail_load: Rc<Cell<bool>>,
}

impl GameStub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn corrupting_checksums_from(frame: i32) -> Self {
        Self {
            corrupt_from: Some(frame),
            ..Self::default()
        }
    }

    /// Makes every replayed frame fail until switched off again.
    pub fn fail_replays(&self, fail: bool) {
        self.fail_advance.set(fail);
    }

    /// Makes every state load fail until switched off again.
    pub fn fail_loads(&self, fail: bool) {
        self.fail_load.set(fail);
    }

    /// A callbacks object sharing this stub's state.
    #[must_use]
    pub fn callbacks(&self) -> Box<dyn SessionCallbacks> {
        Box::new(self.clone())
    }

    /// Simulates one frame in the host loop.
    pub fn simulate(&self, inputs: &SyncedInputs) {
        self.state.borrow_mut().advance(inputs);
    }

    #[must_use]
    pub fn frame(&self) -> i32 {
        self.state.borrow().frame
    }

    #[must_use]
    pub fn value(&self) -> i64 {
        self.state.borrow().value
    }

    #[must_use]
    pub fn checksum_at(&self, frame: i32) -> Option<u64> {
        self.log.borrow().history.get(&frame).copied()
    }

    #[must_use]
    pub fn count(&self, code: EventCode) -> usize {
        self.log.borrow().count(code)
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.log.borrow().events.clone()
    }
}

impl SessionCallbacks for GameStub {
    fn begin_game(&mut self, game: &str) -> Result<(), CallbackError> {
        self.log.borrow_mut().began.push(game.to_owned());
        Ok(())
    }

    fn advance_frame(&mut self, inputs: &SyncedInputs, _flags: u32) -> Result<(), CallbackError> {
        if self.fail_advance.get() {
            return Err(CallbackError::new(format!("replay of frame {} failed", inputs.frame)));
        }
        self.state.borrow_mut().advance(inputs);
        self.log.borrow_mut().replayed += 1;
        Ok(())
    }

    fn save_game_state(&mut self, frame: Frame) -> Result<(SaveBuffer, u64), CallbackError> {
        let state = *self.state.borrow();
        assert_eq!(state.frame, frame.as_i32(), "saving the wrong frame");
        let mut checksum = state.checksum();
        if self.corrupt_from.is_some_and(|from| state.frame >= from) {
            checksum ^= 0xDEAD_BEEF;
        }
        let mut log = self.log.borrow_mut();
        log.saves += 1;
        log.history.insert(state.frame, checksum);
        Ok((SaveBuffer::new(state.to_bytes()), checksum))
    }

    fn load_game_state(&mut self, buffer: &SaveBuffer) -> Result<(), CallbackError> {
        if self.fail_load.get() {
            return Err(CallbackError::new("load failed"));
        }
        *self.state.borrow_mut() = StateStub::from_bytes(buffer.as_bytes())?;
        self.log.borrow_mut().loads += 1;
        Ok(())
    }

    fn log_game_state(&mut self, label: &str, buffer: &SaveBuffer) {
        let state = StateStub::from_bytes(buffer.as_bytes()).unwrap();
        self.log
            .borrow_mut()
            .logged
            .push(format!("{}: {:?}", label, state));
    }

    fn free_buffer(&mut self, _buffer: SaveBuffer) {
        self.log.borrow_mut().frees += 1;
    }

    fn on_event(&mut self, event: &Event) -> Result<(), CallbackError> {
        self.log.borrow_mut().events.push(event.clone());
        Ok(())
    }
}

/// A game whose replays diverge from the first run: every replayed frame adds one.
#[derive(Clone, Default)]
pub struct NondeterministicStub {
    pub inner: GameStub,
}

impl SessionCallbacks for NondeterministicStub {
    fn begin_game(&mut self, game: &str) -> Result<(), CallbackError> {
        self.inner.begin_game(game)
    }

    fn advance_frame(&mut self, inputs: &SyncedInputs, flags: u32) -> Result<(), CallbackError> {
        self.inner.advance_frame(inputs, flags)?;
        self.inner.state.borrow_mut().value += 1;
        Ok(())
    }

    fn save_game_state(&mut self, frame: Frame) -> Result<(SaveBuffer, u64), CallbackError> {
        self.inner.save_game_state(frame)
    }

    fn load_game_state(&mut self, buffer: &SaveBuffer) -> Result<(), CallbackError> {
        self.inner.load_game_state(buffer)
    }

    fn log_game_state(&mut self, label: &str, buffer: &SaveBuffer) {
        self.inner.log_game_state(label, buffer);
    }

    fn free_buffer(&mut self, buffer: SaveBuffer) {
        self.inner.free_buffer(buffer);
    }

    fn on_event(&mut self, event: &Event) -> Result<(), CallbackError> {
        self.inner.on_event(event)
    }
}
