use serde::{Deserialize, Serialize};
use super::task::TaskParams;

/// Analysis parameters as they arrive from the upload form.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ProcessForm {
    pub n_trial: u32,
    pub top_k: u32,
    pub revcom_mode: bool,
    pub min_ham_dist_mode: bool,
}

impl From<ProcessForm> for TaskParams {
    fn from(form: ProcessForm) -> Self {
        Self {
            trial_count: form.n_trial,
            top_k: form.top_k,
            reverse_complement_mode: form.revcom_mode,
            min_hamming_distance_mode: form.min_ham_dist_mode,
        }
    }
}
