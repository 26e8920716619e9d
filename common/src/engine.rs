use chrono::NaiveDateTime;
use log::{info, warn};
use serde::Serialize;

use crate::{
    clock::{Clock, Rtc},
    config::SchedulerConfig,
    error::{Rejection, SchedulerError},
    hal::OutputFactory,
    registry::DeviceRegistry,
    schedule::{self, Drive},
    storage::Storage,
    tasks::TaskStore,
    types::{Device, Task, TimeOfDay},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub now: TimeOfDay,
    pub driven: Vec<Drive>,
    pub retired: Vec<Task>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub time: TimeOfDay,
    #[serde(rename = "dateTime")]
    pub date_time: NaiveDateTime,
    pub tasks: Vec<Task>,
    pub devices: Vec<Device>,
    #[serde(rename = "freeGpio")]
    pub free_gpio: Vec<u8>,
}

pub struct Engine<R, O: OutputFactory, S> {
    config: SchedulerConfig,
    clock: Clock<R, S>,
    devices: DeviceRegistry<O, S>,
    tasks: TaskStore<S>,
}

impl<R: Rtc, O: OutputFactory, S: Storage> Engine<R, O, S> {
    pub fn boot(config: SchedulerConfig, rtc: R, outputs: O, storage: S) -> Self {
        let mut clock = Clock::new(rtc, storage.clone());
        clock.restore_on_boot();

        let devices = DeviceRegistry::load(&config, outputs, storage.clone());
        let tasks = TaskStore::load(storage);

        Self {
            config,
            clock,
            devices,
            tasks,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock<R, S> {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut Clock<R, S> {
        &mut self.clock
    }

    pub fn devices(&self) -> &DeviceRegistry<O, S> {
        &self.devices
    }

    pub fn tasks(&self) -> &[Task] {
        self.tasks.tasks()
    }

    pub fn current_time(&self) -> TimeOfDay {
        self.clock.time_of_day()
    }

    pub fn set_time(&mut self, hour: u32, minute: u32) -> Result<NaiveDateTime, SchedulerError> {
        self.clock.set(hour, minute)
    }

    pub fn add_device(&mut self, name: &str, gpio: &str) -> Result<(), SchedulerError> {
        self.devices.add(name, gpio).map(|_| ())
    }

    pub fn remove_device(&mut self, name: &str) -> Result<Vec<Task>, SchedulerError> {
        match self.devices.remove(name) {
            Ok(_) => {}
            Err(SchedulerError::Rejected(Rejection::UnknownDevice(_))) => {
                info!("no device named `{name}`; clearing its tasks only");
            }
            Err(err) => return Err(err),
        }

        let (removed, persisted) = self.tasks.remove_device(name);
        if let Err(err) = persisted {
            warn!("tasks for `{name}` removed in memory only: {err}");
        }
        if !removed.is_empty() {
            info!("removed {} task(s) bound to `{name}`", removed.len());
        }
        Ok(removed)
    }

    pub fn add_task(&mut self, task: Task) -> Result<(), SchedulerError> {
        let summary = format!(
            "{} {}-{} {}",
            task.device, task.start, task.end, task.recurrence
        );
        self.tasks.add(task)?;
        info!("[{}] new task added: {summary}", self.current_time());
        Ok(())
    }

    pub fn remove_task(&mut self, index: usize) -> Result<Task, SchedulerError> {
        let removed = self.tasks.remove(index)?;
        if let Err(err) = self.devices.force_low(&removed.device) {
            warn!("failed to switch off `{}`: {err}", removed.device);
        }
        info!(
            "[{}] task deleted: {} {}-{} (device turned off)",
            self.current_time(),
            removed.device,
            removed.start,
            removed.end
        );
        Ok(removed)
    }

    pub fn tick(&mut self) -> TickReport {
        let now = self.current_time();

        let mut driven = Vec::new();
        for drive in schedule::evaluate(self.tasks.tasks(), now) {
            match self.devices.drive(&drive.device, drive.high) {
                Ok(true) => driven.push(drive),
                Ok(false) => {}
                Err(err) => warn!("[{now}] {err}"),
            }
        }

        let retired = self.tasks.retire_expired(now);
        TickReport {
            now,
            driven,
            retired,
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let date_time = self.clock.now();
        StatusSnapshot {
            time: TimeOfDay::of(&date_time),
            date_time,
            tasks: self.tasks.tasks().to_vec(),
            devices: self.devices.list().to_vec(),
            free_gpio: self.devices.free_gpio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualRtc,
        hal::SimBoard,
        storage::MemoryStorage,
        types::PinRef,
    };
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    type TestEngine = Engine<ManualRtc, SimBoard, MemoryStorage>;

    fn morning(hour: u32, minute: u32) -> ManualRtc {
        ManualRtc::at(
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(hour, minute, 0)
                .unwrap(),
        )
    }

    fn boot(storage: &MemoryStorage, board: &SimBoard, hour: u32, minute: u32) -> TestEngine {
        // No snapshot in storage, so the manual clock keeps its start value.
        Engine::boot(
            SchedulerConfig::default(),
            morning(hour, minute),
            board.clone(),
            storage.clone(),
        )
    }

    fn at(engine: &mut TestEngine, hour: u32, minute: u32) {
        engine.clock_mut().rtc_mut().advance_to(hour, minute);
    }

    fn task(device: &str, start: &str, end: &str, recurrence: &str) -> Task {
        Task::from_fields(device, start, end, recurrence).unwrap()
    }

    #[test]
    fn pump_scenario_switches_on_then_retires() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 6, 0);
        engine.add_device("Pump", "2").unwrap();
        engine
            .add_task(task("Pump", "06:00", "06:05", "once"))
            .unwrap();

        at(&mut engine, 6, 2);
        let report = engine.tick();
        assert!(board.is_high(PinRef::Gpio(2)));
        assert!(report.retired.is_empty());

        at(&mut engine, 6, 5);
        let report = engine.tick();
        assert!(!board.is_high(PinRef::Gpio(2)));
        assert_eq!(report.retired.len(), 1);
        assert!(engine.tasks().is_empty());
        assert_eq!(storage.get_json("tasks.json"), Some(serde_json::json!([])));
    }

    #[test]
    fn one_shot_task_present_until_its_end_minute() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 7, 0);
        engine
            .add_task(task("Pi LED", "07:00", "08:00", "once"))
            .unwrap();

        at(&mut engine, 7, 59);
        engine.tick();
        assert_eq!(engine.tasks().len(), 1);
        assert!(board.is_high(PinRef::Onboard));

        at(&mut engine, 8, 0);
        engine.tick();
        assert!(engine.tasks().is_empty());
        assert!(!board.is_high(PinRef::Onboard));
    }

    #[test]
    fn daily_task_survives_its_end() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 7, 0);
        engine
            .add_task(task("Pi LED", "07:00", "08:00", "daily"))
            .unwrap();

        at(&mut engine, 23, 59);
        engine.tick();
        assert_eq!(engine.tasks().len(), 1);
        assert!(!board.is_high(PinRef::Onboard));
    }

    #[test]
    fn deleting_task_forces_output_low_inside_window() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 6, 0);
        engine.add_device("Pump", "2").unwrap();
        engine
            .add_task(task("Pump", "06:00", "09:00", "daily"))
            .unwrap();
        engine.tick();
        assert!(board.is_high(PinRef::Gpio(2)));

        let removed = engine.remove_task(0).unwrap();

        assert_eq!(removed.device, "Pump");
        assert!(!board.is_high(PinRef::Gpio(2)));
        engine.tick();
        assert!(!board.is_high(PinRef::Gpio(2)));
    }

    #[test]
    fn duplicate_task_leaves_store_unchanged() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 6, 0);
        engine
            .add_task(task("Pi LED", "06:00", "07:00", "daily"))
            .unwrap();
        let before = engine.tasks().to_vec();

        let err = engine
            .add_task(task("Pi LED", "08:00", "09:00", "once"))
            .unwrap_err();

        assert_eq!(
            err.rejection(),
            Some(&Rejection::TaskExists("Pi LED".to_string()))
        );
        assert_eq!(engine.tasks(), before.as_slice());
    }

    #[test]
    fn deleting_device_cascades_to_tasks_and_output() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 6, 0);
        engine.add_device("Pump", "2").unwrap();
        engine
            .add_task(task("Pump", "06:00", "09:00", "daily"))
            .unwrap();
        engine
            .add_task(task("Pi LED", "06:00", "09:00", "daily"))
            .unwrap();
        engine.tick();
        assert!(board.is_high(PinRef::Gpio(2)));

        let removed = engine.remove_device("Pump").unwrap();

        assert_eq!(removed.len(), 1);
        assert!(!board.is_high(PinRef::Gpio(2)));
        let names: Vec<_> = engine.devices().list().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Pi LED"]);
        assert_eq!(engine.tasks().len(), 1);
        assert_eq!(engine.tasks()[0].device, "Pi LED");
    }

    #[test]
    fn dangling_task_has_no_effect() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 6, 0);
        engine
            .add_task(task("Ghost", "06:00", "09:00", "daily"))
            .unwrap();

        let report = engine.tick();

        assert!(report.driven.is_empty());
        assert_eq!(engine.tasks().len(), 1);
    }

    #[test]
    fn deleting_unknown_device_clears_its_tasks() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 6, 0);
        engine
            .add_task(task("Ghost", "06:00", "09:00", "daily"))
            .unwrap();
        engine
            .add_task(task("Pi LED", "06:00", "09:00", "daily"))
            .unwrap();

        let removed = engine.remove_device("Ghost").unwrap();

        assert_eq!(removed.len(), 1);
        assert_eq!(engine.tasks().len(), 1);
        assert_eq!(engine.tasks()[0].device, "Pi LED");
        assert_eq!(
            storage.get_json("tasks.json").unwrap().as_array().unwrap().len(),
            1
        );
    }

    #[test]
    fn onboard_device_removal_is_still_rejected() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 6, 0);
        engine
            .add_task(task("Pi LED", "06:00", "09:00", "daily"))
            .unwrap();

        let err = engine.remove_device("Pi LED").unwrap_err();

        assert_eq!(
            err.rejection(),
            Some(&Rejection::Permanent("Pi LED".to_string()))
        );
        assert_eq!(engine.tasks().len(), 1);
    }

    #[test]
    fn pin_fault_during_tick_does_not_stop_other_devices() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 6, 0);
        engine.add_device("Pump", "2").unwrap();
        engine.add_device("Fan", "3").unwrap();
        engine
            .add_task(task("Pump", "06:00", "09:00", "daily"))
            .unwrap();
        engine
            .add_task(task("Fan", "06:00", "09:00", "daily"))
            .unwrap();
        board.break_pin(PinRef::Gpio(2));

        let report = engine.tick();

        assert_eq!(report.driven.len(), 1);
        assert!(board.is_high(PinRef::Gpio(3)));
    }

    #[test]
    fn state_survives_reboot() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        {
            let mut engine = boot(&storage, &board, 6, 0);
            engine.add_device("Pump", "2").unwrap();
            engine
                .add_task(task("Pump", "06:00", "06:30", "daily"))
                .unwrap();
            engine.set_time(6, 10).unwrap();
        }

        let rebooted = Engine::boot(
            SchedulerConfig::default(),
            ManualRtc::power_on(),
            SimBoard::new(),
            storage.clone(),
        );

        assert_eq!(rebooted.current_time().to_string(), "06:10");
        assert_eq!(rebooted.tasks().len(), 1);
        assert!(rebooted.devices().is_bound("Pump"));
        let status = rebooted.status();
        assert_eq!(status.devices.len(), 2);
        assert!(!status.free_gpio.contains(&2));
    }

    #[test]
    fn failed_persist_during_retire_keeps_memory_authoritative() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut engine = boot(&storage, &board, 6, 0);
        engine
            .add_task(task("Pi LED", "06:00", "06:05", "once"))
            .unwrap();

        storage.fail_writes(true);
        at(&mut engine, 6, 5);
        let report = engine.tick();

        assert_eq!(report.retired.len(), 1);
        assert!(engine.tasks().is_empty());
        assert_eq!(
            storage.get_json("tasks.json").unwrap().as_array().unwrap().len(),
            1
        );
    }
}
