use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::config::AppConfig;
use crate::models::BusinessProfile;
use crate::services::calendar_store::CalendarStore;
use crate::services::sessions::SessionRegistry;

pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub config: AppConfig,
    pub profile: Arc<BusinessProfile>,
    pub store: Arc<dyn CalendarStore>,
    pub registry: Arc<SessionRegistry>,
}
