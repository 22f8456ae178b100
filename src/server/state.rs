use std::sync::Arc;

use crate::control::ControlPlane;

#[derive(Clone)]
pub(crate) struct ServeState {
    pub(crate) plane: Arc<ControlPlane>,
}

impl ServeState {
    pub(crate) fn new(plane: Arc<ControlPlane>) -> Self {
        Self { plane }
    }
}
