use tracing::warn;
use uuid::Uuid;

use crate::evolution::{AnalysisWindow, EvolutionError};
use crate::models::{Session, SessionStatus};

/// What the watcher knows about one analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: Option<Uuid>,
    pub status: SessionStatus,
    pub progress: f32,
    pub window: Option<AnalysisWindow>,
    /// Why the loaded session config gave no window.
    pub window_error: Option<EvolutionError>,
    /// Set when the evolution series has to be recomputed from fresh results.
    pub needs_results: bool,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            session_id: None,
            status: SessionStatus::Pending,
            progress: 0.0,
            window: None,
            window_error: None,
            needs_results: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Loaded(Session),
    StatusChanged { status: SessionStatus, progress: f32 },
    WindowChanged(AnalysisWindow),
    ResultsLoaded,
}

fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}

/// Next view after `event`. Terminal runs only accept window changes and result loads.
pub fn apply(view: &SessionView, event: SessionEvent) -> SessionView {
    let mut next = view.clone();

    match event {
        SessionEvent::Loaded(session) => {
            next.session_id = Some(session.id);
            next.status = session.status;
            next.progress = clamp_progress(session.progress);
            match AnalysisWindow::from_config(&session.config) {
                Ok(window) => {
                    next.window = Some(window);
                    next.window_error = None;
                }
                Err(err) => {
                    warn!(
                        session = %session.id,
                        error = %err,
                        "session config has no usable window"
                    );
                    next.window = None;
                    next.window_error = Some(err);
                }
            }
            next.needs_results = session.status == SessionStatus::Completed;
        }
        SessionEvent::StatusChanged { status, progress } => {
            if view.status.is_terminal() {
                return next;
            }
            next.status = status;
            next.progress = if status == SessionStatus::Completed {
                100.0
            } else {
                clamp_progress(progress).max(view.progress)
            };
            next.needs_results = status == SessionStatus::Completed;
        }
        SessionEvent::WindowChanged(window) => {
            let changed = view.window != Some(window);
            next.needs_results =
                view.needs_results || (changed && view.status == SessionStatus::Completed);
            next.window = Some(window);
            next.window_error = None;
        }
        SessionEvent::ResultsLoaded => {
            next.needs_results = false;
        }
    }

    next
}
