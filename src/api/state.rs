use crate::config::Config;
use crate::scheduler::{Scheduler, TriggerChannel};
use crate::speedcheck::Progress;
use crate::storage::Pool;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct AppState {
    pub db: Pool,
    pub scheduler: Arc<Scheduler>,
    pub trigger: TriggerChannel,
    pub config: Arc<RwLock<Config>>,
    pub config_path: PathBuf,
    pub progress: Arc<Progress>,
    pub force_close: Arc<AtomicBool>,
}
