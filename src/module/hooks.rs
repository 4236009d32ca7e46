//! 解析钩子
//!
//! 嵌入方可以在提供者选择和单例检查之前过滤候选。

use semver::Version;

use super::generation::GenerationId;

/// 参与解析的模块代摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleCandidate {
    pub module_id: u64,
    pub generation: GenerationId,
    pub symbolic_name: String,
    pub version: Version,
}

/// 解析钩子
pub trait ResolverHook: Send + Sync {
    /// 从候选提供者中移除对 `consumer` 不可见的项
    fn filter_providers(&self, consumer: &ModuleCandidate, candidates: &mut Vec<ModuleCandidate>);
}

/// 单例冲突过滤器
pub trait CollisionFilter: Send + Sync {
    /// 在单例检查前从冲突集中移除条目，剩余条目仍视为冲突
    fn filter_collisions(&self, resolving: &ModuleCandidate, collisions: &mut Vec<ModuleCandidate>);
}

impl<F> ResolverHook for F
where
    F: Fn(&ModuleCandidate, &ModuleCandidate) -> bool + Send + Sync,
{
    fn filter_providers(&self, consumer: &ModuleCandidate, candidates: &mut Vec<ModuleCandidate>) {
        candidates.retain(|candidate| self(consumer, candidate));
    }
}

/// 放行所有冲突的过滤器
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllCollisions;

impl CollisionFilter for AllowAllCollisions {
    fn filter_collisions(&self, _resolving: &ModuleCandidate, collisions: &mut Vec<ModuleCandidate>) {
        collisions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(module_id: u64, name: &str) -> ModuleCandidate {
        ModuleCandidate {
            module_id,
            generation: GenerationId(module_id * 10),
            symbolic_name: name.to_string(),
            version: Version::new(1, 0, 0),
        }
    }

    #[test]
    fn test_closure_hook() {
        let hook = |_consumer: &ModuleCandidate, provider: &ModuleCandidate| provider.module_id != 2;
        let mut candidates = vec![candidate(1, "a"), candidate(2, "b"), candidate(3, "c")];
        hook.filter_providers(&candidate(9, "consumer"), &mut candidates);
        assert_eq!(
            candidates.iter().map(|c| c.module_id).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn test_allow_all_collisions() {
        let mut collisions = vec![candidate(1, "a")];
        AllowAllCollisions.filter_collisions(&candidate(2, "a"), &mut collisions);
        assert!(collisions.is_empty());
    }
}
