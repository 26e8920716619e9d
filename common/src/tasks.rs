use log::{info, warn};

use crate::{
    error::{Rejection, SchedulerError, StorageError},
    storage::{load_json, save_json, Storage},
    types::{Task, TimeOfDay},
};

#[derive(Debug)]
pub struct TaskStore<S> {
    tasks: Vec<Task>,
    storage: S,
}

impl<S: Storage> TaskStore<S> {
    pub const KEY: &'static str = "tasks.json";

    pub fn load(storage: S) -> Self {
        let (tasks, rewrite) = match load_json::<Vec<serde_json::Value>, _>(&storage, Self::KEY) {
            Ok(Some(records)) => {
                let total = records.len();
                let tasks = normalize(records);
                let dropped = total - tasks.len();
                (tasks, dropped > 0)
            }
            Ok(None) => (Vec::new(), true),
            Err(err) => {
                warn!("failed to load tasks, starting empty: {err}");
                (Vec::new(), true)
            }
        };

        let store = Self { tasks, storage };
        if rewrite {
            if let Err(err) = store.persist(&store.tasks) {
                warn!("failed to write initial task list: {err}");
            }
        }
        info!("loaded {} task(s)", store.tasks.len());
        store
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn has_task_for(&self, device: &str) -> bool {
        self.tasks.iter().any(|task| task.device == device)
    }

    pub fn add(&mut self, task: Task) -> Result<(), SchedulerError> {
        if self.has_task_for(&task.device) {
            return Err(Rejection::TaskExists(task.device).into());
        }

        let mut next = self.tasks.clone();
        next.push(task);
        self.persist(&next)?;
        self.tasks = next;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<Task, SchedulerError> {
        if index >= self.tasks.len() {
            return Err(Rejection::IndexOutOfRange {
                index,
                len: self.tasks.len(),
            }
            .into());
        }

        let mut next = self.tasks.clone();
        let removed = next.remove(index);
        self.persist(&next)?;
        self.tasks = next;
        Ok(removed)
    }

    pub fn remove_device(&mut self, device: &str) -> (Vec<Task>, Result<(), StorageError>) {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .tasks
            .drain(..)
            .partition(|task| task.device == device);
        self.tasks = kept;

        if removed.is_empty() {
            return (removed, Ok(()));
        }
        let result = self.persist(&self.tasks);
        (removed, result)
    }

    pub fn retire_expired(&mut self, now: TimeOfDay) -> Vec<Task> {
        let (retired, kept): (Vec<_>, Vec<_>) =
            self.tasks.drain(..).partition(|task| task.is_expired(now));
        self.tasks = kept;

        if !retired.is_empty() {
            for task in &retired {
                info!(
                    "[{now}] one-time task removed: {} {}-{}",
                    task.device, task.start, task.end
                );
            }
            if let Err(err) = self.persist(&self.tasks) {
                warn!("failed to persist retired tasks, keeping in-memory list: {err}");
            }
        }
        retired
    }

    fn persist(&self, tasks: &[Task]) -> Result<(), StorageError> {
        save_json(&self.storage, Self::KEY, tasks)
    }
}

fn normalize(records: Vec<serde_json::Value>) -> Vec<Task> {
    let mut tasks: Vec<Task> = Vec::with_capacity(records.len());
    for record in records {
        match serde_json::from_value::<Task>(record.clone()) {
            Ok(task) if tasks.iter().any(|kept| kept.device == task.device) => {
                warn!("dropping extra task for device `{}`", task.device);
            }
            Ok(task) => tasks.push(task),
            Err(err) => warn!("dropping malformed task record {record}: {err}"),
        }
    }
    tasks
}
