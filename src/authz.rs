//! Authorization oracle (C4): decides whether an acting user may touch a
//! work order, without mutating anything. Called before the transition
//! engine opens its transaction, mirroring `JudgeUserAuthority` being
//! invoked ahead of `HandleWorkOrder` in the original service.

use crate::error::{EngineError, EngineResult};
use crate::resolver::UserDirectory;
use crate::state::WorkOrder;

#[derive(Debug, Clone, Copy)]
pub struct ActingUser {
    pub id: i64,
}

/// May `user` act on the active position `node_id` of `work_order`? True if
/// the user holds the administrative role from configuration, is a direct
/// processor on that position, or the position's `process_method` is
/// `role`/`department` and the user belongs to one of the ids recorded in
/// `processor`. The engine normally pre-expands `processor` to concrete user
/// ids before it ever reaches storage, so this last branch only matters when
/// a caller writes raw role/department ids in directly (ActiveClaim,
/// spec.md §4.8) and bypasses that expansion.
pub async fn can_handle(
    work_order: &WorkOrder,
    node_id: &str,
    user: ActingUser,
    admin_role_id: i64,
    directory: &dyn UserDirectory,
) -> EngineResult<bool> {
    if directory.role_ids_for_user(user.id).await?.contains(&admin_role_id) {
        return Ok(true);
    }
    let Some(active) = work_order.active_state(node_id) else {
        return Ok(false);
    };
    if active.processor.iter().any(|p| p.as_i64() == Some(user.id)) {
        return Ok(true);
    }
    match active.process_method.as_deref() {
        Some("role") => {
            let user_roles = directory.role_ids_for_user(user.id).await?;
            Ok(active
                .processor
                .iter()
                .filter_map(|p| p.as_i64())
                .any(|role_id| user_roles.contains(&role_id)))
        }
        Some("department") => {
            let user_depts = directory.department_ids_for_user(user.id).await?;
            Ok(active
                .processor
                .iter()
                .filter_map(|p| p.as_i64())
                .any(|dept_id| user_depts.contains(&dept_id)))
        }
        _ => Ok(false),
    }
}

/// A user may view a work order if they created it, are named in
/// `related_person`, or currently appear as a processor on any active
/// position, or hold the administrative role.
pub async fn can_view(
    work_order: &WorkOrder,
    user: ActingUser,
    admin_role_id: i64,
    directory: &dyn UserDirectory,
) -> EngineResult<bool> {
    if work_order.creator == user.id || work_order.related_person.contains(&user.id) {
        return Ok(true);
    }
    if work_order
        .state
        .iter()
        .any(|s| s.processor.iter().any(|p| p.as_i64() == Some(user.id)))
    {
        return Ok(true);
    }
    Ok(directory.role_ids_for_user(user.id).await?.contains(&admin_role_id))
}

pub async fn require_handle(
    work_order: &WorkOrder,
    node_id: &str,
    user: ActingUser,
    admin_role_id: i64,
    directory: &dyn UserDirectory,
) -> EngineResult<()> {
    if can_handle(work_order, node_id, user, admin_role_id, directory).await? {
        Ok(())
    } else {
        Err(EngineError::Unauthorized {
            user_id: user.id,
            work_order_id: work_order.id,
            action: "handle",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ActiveState;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    struct FakeDirectory {
        admin_users: Vec<i64>,
        role_members: Vec<(i64, Vec<i64>)>,
        dept_members: Vec<(i64, Vec<i64>)>,
    }

    #[async_trait]
    impl UserDirectory for FakeDirectory {
        async fn user_exists(&self, _user_id: i64) -> EngineResult<bool> {
            Ok(true)
        }
        async fn users_in_role(&self, _role_id: i64) -> EngineResult<Vec<i64>> {
            Ok(vec![])
        }
        async fn role_ids_for_user(&self, user_id: i64) -> EngineResult<Vec<i64>> {
            let mut roles: Vec<i64> = self
                .role_members
                .iter()
                .filter(|(_, members)| members.contains(&user_id))
                .map(|(role_id, _)| *role_id)
                .collect();
            if self.admin_users.contains(&user_id) {
                roles.push(99);
            }
            Ok(roles)
        }
        async fn users_in_department(&self, _dept_id: i64) -> EngineResult<Vec<i64>> {
            Ok(vec![])
        }
        async fn department_ids_for_user(&self, user_id: i64) -> EngineResult<Vec<i64>> {
            Ok(self
                .dept_members
                .iter()
                .filter(|(_, members)| members.contains(&user_id))
                .map(|(dept_id, _)| *dept_id)
                .collect())
        }
        async fn display_name(&self, _user_id: i64) -> EngineResult<Option<String>> {
            Ok(None)
        }
        async fn email_for_user(&self, _user_id: i64) -> EngineResult<Option<String>> {
            Ok(None)
        }
    }

    fn fake_directory() -> FakeDirectory {
        FakeDirectory { admin_users: vec![], role_members: vec![], dept_members: vec![] }
    }

    fn work_order() -> WorkOrder {
        WorkOrder {
            id: 1,
            process_id: 1,
            title: "t".into(),
            priority: 1,
            creator: 10,
            related_person: vec![],
            state: vec![ActiveState {
                node_id: "n2".into(),
                label: "n2".into(),
                processor: vec![json!(42)],
                process_method: None,
            }],
            is_end: false,
            classify: 1,
            urge_count: 0,
            urge_last_time: None,
            create_time: Utc::now(),
        }
    }

    fn work_order_with_method(process_method: Option<&str>, processor: Vec<serde_json::Value>) -> WorkOrder {
        let mut wo = work_order();
        wo.state[0].process_method = process_method.map(str::to_string);
        wo.state[0].processor = processor;
        wo
    }

    #[tokio::test]
    async fn assignee_may_handle() {
        let dir = fake_directory();
        assert!(can_handle(&work_order(), "n2", ActingUser { id: 42 }, 99, &dir).await.unwrap());
    }

    #[tokio::test]
    async fn non_assignee_denied() {
        let dir = fake_directory();
        assert!(!can_handle(&work_order(), "n2", ActingUser { id: 7 }, 99, &dir).await.unwrap());
    }

    #[tokio::test]
    async fn admin_role_overrides() {
        let dir = FakeDirectory { admin_users: vec![7], ..fake_directory() };
        assert!(can_handle(&work_order(), "n2", ActingUser { id: 7 }, 99, &dir).await.unwrap());
    }

    #[tokio::test]
    async fn role_member_may_handle_role_assigned_position() {
        let dir = FakeDirectory { role_members: vec![(5, vec![7])], ..fake_directory() };
        let wo = work_order_with_method(Some("role"), vec![json!(5)]);
        assert!(can_handle(&wo, "n2", ActingUser { id: 7 }, 99, &dir).await.unwrap());
    }

    #[tokio::test]
    async fn non_role_member_denied_role_assigned_position() {
        let dir = FakeDirectory { role_members: vec![(5, vec![7])], ..fake_directory() };
        let wo = work_order_with_method(Some("role"), vec![json!(5)]);
        assert!(!can_handle(&wo, "n2", ActingUser { id: 1 }, 99, &dir).await.unwrap());
    }

    #[tokio::test]
    async fn department_member_may_handle_department_assigned_position() {
        let dir = FakeDirectory { dept_members: vec![(3, vec![8])], ..fake_directory() };
        let wo = work_order_with_method(Some("department"), vec![json!(3)]);
        assert!(can_handle(&wo, "n2", ActingUser { id: 8 }, 99, &dir).await.unwrap());
    }
}
