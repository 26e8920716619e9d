use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
};

use log::debug;

use crate::{error::PinError, types::PinRef};

pub trait OutputPin {
    fn set_level(&mut self, high: bool) -> Result<(), PinError>;
}

pub trait OutputFactory {
    type Pin: OutputPin;

    fn onboard(&mut self) -> Result<Self::Pin, PinError>;
    fn output(&mut self, gpio: u8) -> Result<Self::Pin, PinError>;

    fn open(&mut self, pin: PinRef) -> Result<Self::Pin, PinError> {
        match pin {
            PinRef::Onboard => self.onboard(),
            PinRef::Gpio(gpio) => self.output(gpio),
        }
    }
}

#[derive(Debug, Default)]
struct BoardState {
    levels: BTreeMap<PinRef, bool>,
    broken: BTreeSet<PinRef>,
}

#[derive(Debug, Clone, Default)]
pub struct SimBoard {
    state: Arc<Mutex<BoardState>>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, pin: PinRef) -> Option<bool> {
        self.lock().levels.get(&pin).copied()
    }

    pub fn is_high(&self, pin: PinRef) -> bool {
        self.level(pin).unwrap_or(false)
    }

    pub fn break_pin(&self, pin: PinRef) {
        self.lock().broken.insert(pin);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutputFactory for SimBoard {
    type Pin = SimPin;

    fn onboard(&mut self) -> Result<SimPin, PinError> {
        self.open_sim(PinRef::Onboard)
    }

    fn output(&mut self, gpio: u8) -> Result<SimPin, PinError> {
        self.open_sim(PinRef::Gpio(gpio))
    }
}

impl SimBoard {
    fn open_sim(&mut self, pin: PinRef) -> Result<SimPin, PinError> {
        let mut state = self.lock();
        if state.broken.contains(&pin) {
            return Err(PinError::Unavailable {
                pin,
                reason: "simulated fault".to_string(),
            });
        }
        state.levels.insert(pin, false);
        Ok(SimPin {
            pin,
            board: self.clone(),
        })
    }
}

#[derive(Debug)]
pub struct SimPin {
    pin: PinRef,
    board: SimBoard,
}

impl OutputPin for SimPin {
    fn set_level(&mut self, high: bool) -> Result<(), PinError> {
        let mut state = self.board.lock();
        if state.broken.contains(&self.pin) {
            return Err(PinError::Write {
                pin: self.pin,
                reason: "simulated fault".to_string(),
            });
        }
        if state.levels.insert(self.pin, high) != Some(high) {
            debug!("sim output {} -> {}", self.pin, if high { "high" } else { "low" });
        }
        Ok(())
    }
}
