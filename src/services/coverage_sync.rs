use std::sync::Arc;

use crate::db::models::{Assignment, Coverage, CoverageStatus, Planning};
use crate::db::store::AssignmentStore;
use crate::error::AppResult;

/// Refreshes the `assigned_to` projection of each coverage from its assignment.
///
/// Read path only: the returned planning item is never written back.
#[derive(Clone)]
pub struct PlanningCoverageSync {
    assignments: Arc<dyn AssignmentStore>,
}

/// Copy the authoritative assignment fields onto the coverage projection.
pub fn project_assignment(coverage: &mut Coverage, assignment: &Assignment) {
    coverage.assigned_to.assignment_id = Some(assignment.id.clone());
    coverage.assigned_to.user = assignment.assigned_to.user.clone();
    coverage.assigned_to.desk = assignment.assigned_to.desk.clone();
    coverage.assigned_to.state = Some(assignment.assigned_to.state);
    coverage.workflow_status = CoverageStatus::from(assignment.assigned_to.state);
}

impl PlanningCoverageSync {
    pub fn new(assignments: Arc<dyn AssignmentStore>) -> Self {
        Self { assignments }
    }

    pub async fn sync(&self, mut planning: Planning) -> AppResult<Planning> {
        for coverage in planning.coverages.iter_mut() {
            let Some(assignment_id) = coverage.assigned_to.assignment_id.clone() else {
                continue;
            };

            match self.assignments.find_one(&assignment_id).await? {
                Some(assignment) => project_assignment(coverage, &assignment),
                None => tracing::debug!(
                    "Assignment {} of coverage {} not found; keeping stale projection",
                    assignment_id,
                    coverage.coverage_id
                ),
            }
        }
        Ok(planning)
    }
}
