use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use batch_core::{traits::MetadataStore, SchedulerError, SchedulerResult};

/// 任务依赖边校验
pub struct DependencyChecker {
    metadata: Arc<dyn MetadataStore>,
}

impl DependencyChecker {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// 校验新增依赖边 `task_id -> dependency_id`
    ///
    /// 拒绝自依赖、不存在的任务以及会形成环的边。
    pub async fn validate_dependency(&self, task_id: i64, dependency_id: i64) -> SchedulerResult<()> {
        if task_id == dependency_id {
            return Err(SchedulerError::CircularDependency);
        }
        if self.metadata.get_task(task_id).await?.is_none() {
            return Err(SchedulerError::TaskNotFound { id: task_id });
        }
        if self.metadata.get_task(dependency_id).await?.is_none() {
            return Err(SchedulerError::DependencyNotFound {
                task_id,
                dependency_id,
            });
        }
        if self.detect_circular_dependency(task_id, dependency_id).await? {
            warn!(
                "检测到循环依赖，任务ID: {}, 新依赖: {}",
                task_id, dependency_id
            );
            return Err(SchedulerError::CircularDependency);
        }
        Ok(())
    }

    /// 依赖任务（传递地）已经依赖 `task_id` 时，新边会形成环
    pub async fn detect_circular_dependency(
        &self,
        task_id: i64,
        dependency_id: i64,
    ) -> SchedulerResult<bool> {
        let transitive = self.get_transitive_dependencies(dependency_id).await?;
        Ok(transitive.contains(&task_id))
    }

    /// 广度优先收集任务的全部传递依赖
    pub async fn get_transitive_dependencies(&self, task_id: i64) -> SchedulerResult<Vec<i64>> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut result = Vec::new();

        for dep_id in self.metadata.list_task_dependencies(task_id).await? {
            if visited.insert(dep_id) {
                queue.push_back(dep_id);
            }
        }
        while let Some(current_id) = queue.pop_front() {
            result.push(current_id);
            for dep_id in self.metadata.list_task_dependencies(current_id).await? {
                if visited.insert(dep_id) {
                    queue.push_back(dep_id);
                }
            }
        }

        debug!("任务 {} 的传递依赖: {:?}", task_id, result);
        Ok(result)
    }
}
