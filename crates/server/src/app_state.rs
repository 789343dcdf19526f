use std::path::PathBuf;

use server_api::ApiContext;

use crate::hub::Hub;

pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) hub: Hub,
    pub(crate) max_upload_bytes: usize,
    pub(crate) static_dir: Option<PathBuf>,
}
