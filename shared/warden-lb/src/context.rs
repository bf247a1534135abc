use std::sync::Arc;

use crate::health::HealthFetcher;
use crate::ipvs::KernelTable;
use crate::status_file::StatusFiles;

/// Collaborators a check cycle needs
#[derive(Clone)]
pub struct CheckContext {
    pub health: Arc<dyn HealthFetcher>,
    pub status: Arc<dyn StatusFiles>,
    pub kernel: Arc<dyn KernelTable>,
}

impl CheckContext {
    pub fn new(
        health: Arc<dyn HealthFetcher>,
        status: Arc<dyn StatusFiles>,
        kernel: Arc<dyn KernelTable>,
    ) -> Self {
        Self { health, status, kernel }
    }
}
