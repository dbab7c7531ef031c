//! Cross-module end-to-end scenarios run against `MemoryStore`, distinct
//! from the per-module unit tests: a work order's full life, asserting on
//! the literal circulation values a caller actually sees.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use workorder_engine::authz::ActingUser;
use workorder_engine::engine::{CreateWorkOrderRequest, Engine, HandleWorkOrderRequest};
use workorder_engine::error::EngineResult;
use workorder_engine::graph::{Graph, GraphEdge, GraphNode, NodeClass, Process};
use workorder_engine::resolver::UserDirectory;
use workorder_engine::store::memory::MemoryStore;
use workorder_engine::store::ProcessStore;

struct NoopDirectory;

#[async_trait]
impl UserDirectory for NoopDirectory {
    async fn user_exists(&self, _user_id: i64) -> EngineResult<bool> {
        Ok(true)
    }
    async fn users_in_role(&self, _role_id: i64) -> EngineResult<Vec<i64>> {
        Ok(vec![])
    }
    async fn role_ids_for_user(&self, _user_id: i64) -> EngineResult<Vec<i64>> {
        Ok(vec![])
    }
    async fn users_in_department(&self, _dept_id: i64) -> EngineResult<Vec<i64>> {
        Ok(vec![])
    }
    async fn department_ids_for_user(&self, _user_id: i64) -> EngineResult<Vec<i64>> {
        Ok(vec![])
    }
    async fn display_name(&self, _user_id: i64) -> EngineResult<Option<String>> {
        Ok(None)
    }
    async fn email_for_user(&self, _user_id: i64) -> EngineResult<Option<String>> {
        Ok(None)
    }
}

fn node(id: &str, clazz: NodeClass, processor: Vec<serde_json::Value>) -> GraphNode {
    let process_method = if processor.is_empty() { None } else { Some("person".into()) };
    GraphNode {
        id: id.into(),
        label: id.into(),
        clazz,
        processor,
        process_method,
        cc: vec![],
    }
}

fn edge(id: &str, source: &str, target: &str) -> GraphEdge {
    GraphEdge { id: id.into(), source: source.into(), target: target.into(), condition_expression: vec![] }
}

/// start -> review (user task, assignee 2) -> end.
fn approval_process() -> Process {
    Process {
        id: 1,
        name: "approval".into(),
        submit_count: 0,
        notice: vec![],
        graph: Graph {
            nodes: vec![
                node("start", NodeClass::Start, vec![]),
                node("review", NodeClass::UserTask, vec![json!(2)]),
                node("end", NodeClass::End, vec![]),
            ],
            edges: vec![edge("e1", "start", "review"), edge("e2", "review", "end")],
        },
    }
}

fn engine(store: Arc<MemoryStore>) -> Engine<MemoryStore> {
    Engine::new(store, Arc::new(NoopDirectory), None, None, 99)
}

fn create_req() -> CreateWorkOrderRequest {
    CreateWorkOrderRequest {
        process_id: 1,
        creator: 1,
        title: "expense report".into(),
        priority: 1,
        classify: 1,
        related_person: vec![],
        templates: vec![(json!({}), json!({}))],
        is_exec_task: false,
        tasks: vec![],
    }
}

#[tokio::test]
async fn new_work_order_records_literal_created_history() {
    let store = Arc::new(MemoryStore::new(vec![approval_process()]));
    let eng = engine(store.clone());

    let wo = eng.create(create_req()).await.unwrap();
    assert_eq!(wo.state[0].node_id, "review");

    let history = store.list_history(wo.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].circulation, "新建");
    assert_eq!(history[0].target.as_deref(), Some("review"));
}

#[tokio::test]
async fn approving_the_last_position_closes_the_work_order_and_records_literal_end_target() {
    let store = Arc::new(MemoryStore::new(vec![approval_process()]));
    let eng = engine(store.clone());
    let wo = eng.create(create_req()).await.unwrap();

    let handled = eng
        .handle(HandleWorkOrderRequest {
            work_order_id: wo.id,
            node_id: "review".into(),
            acting_user: ActingUser { id: 2 },
            circulation: "同意".into(),
            remarks: "looks good".into(),
            form_updates: vec![],
            is_exec_task: false,
            tasks: vec![],
        })
        .await
        .unwrap();

    assert!(handled.is_end);
    assert!(handled.state.is_empty());

    let history = store.list_history(wo.id).await.unwrap();
    // Most-recent-first.
    assert_eq!(history[0].circulation, "同意");
    // The node being left out to an End node still gets its target
    // recorded, even though the End branch leaves no active state behind.
    assert_eq!(history[0].target.as_deref(), Some("end"));
}

#[tokio::test]
async fn rejecting_keeps_the_work_order_open_with_literal_rejected_history() {
    let mut process = approval_process();
    process.graph.nodes.push(node("rework", NodeClass::UserTask, vec![json!(1)]));
    process.graph.edges = vec![
        edge("e1", "start", "review"),
        edge("e2", "review", "rework"),
        edge("e3", "rework", "end"),
    ];

    let store = Arc::new(MemoryStore::new(vec![process]));
    let eng = engine(store.clone());
    let wo = eng.create(create_req()).await.unwrap();

    let handled = eng
        .handle(HandleWorkOrderRequest {
            work_order_id: wo.id,
            node_id: "review".into(),
            acting_user: ActingUser { id: 2 },
            circulation: "拒绝".into(),
            remarks: "needs more detail".into(),
            form_updates: vec![],
            is_exec_task: false,
            tasks: vec![],
        })
        .await
        .unwrap();

    assert!(!handled.is_end);
    assert_eq!(handled.state[0].node_id, "rework");
    let history = store.list_history(wo.id).await.unwrap();
    assert_eq!(history[0].circulation, "拒绝");
}

#[tokio::test]
async fn manual_end_records_literal_work_order_end_circulation() {
    use workorder_engine::lifecycle::LifecycleOps;

    let store = Arc::new(MemoryStore::new(vec![approval_process()]));
    let eng = engine(store.clone());
    let wo = eng.create(create_req()).await.unwrap();

    let lifecycle = LifecycleOps::new(store.clone(), 600);
    lifecycle.manual_end(wo.id, 1).await.unwrap();

    let ended = store.get_work_order(wo.id).await.unwrap();
    assert!(ended.is_end);
    let history = store.list_history(wo.id).await.unwrap();
    assert_eq!(history[0].circulation, "工单结束");
}

#[tokio::test]
async fn transfer_records_literal_transfer_circulation_and_reassigns() {
    use workorder_engine::lifecycle::LifecycleOps;

    let store = Arc::new(MemoryStore::new(vec![approval_process()]));
    let eng = engine(store.clone());
    let wo = eng.create(create_req()).await.unwrap();

    let lifecycle = LifecycleOps::new(store.clone(), 600);
    let transferred = lifecycle.transfer(wo.id, "review", 5, 1).await.unwrap();

    assert_eq!(transferred.active_state("review").unwrap().processor, vec![json!(5)]);
    let history = store.list_history(wo.id).await.unwrap();
    assert_eq!(history[0].circulation, "转交工单");
}

#[tokio::test]
async fn non_assignee_cannot_handle_a_position_they_are_not_named_on() {
    let store = Arc::new(MemoryStore::new(vec![approval_process()]));
    let eng = engine(store.clone());
    let wo = eng.create(create_req()).await.unwrap();

    let result = eng
        .handle(HandleWorkOrderRequest {
            work_order_id: wo.id,
            node_id: "review".into(),
            acting_user: ActingUser { id: 999 },
            circulation: "同意".into(),
            remarks: String::new(),
            form_updates: vec![],
            is_exec_task: false,
            tasks: vec![],
        })
        .await;

    assert!(matches!(result, Err(workorder_engine::error::EngineError::Unauthorized { .. })));
}

#[tokio::test]
async fn parallel_fork_waits_for_every_branch_before_the_join_advances() {
    let process = Process {
        id: 2,
        name: "parallel".into(),
        submit_count: 0,
        notice: vec![],
        graph: Graph {
            nodes: vec![
                node("start", NodeClass::Start, vec![]),
                node("fork", NodeClass::ParallelGateway, vec![]),
                node("legal", NodeClass::UserTask, vec![json!(2)]),
                node("finance", NodeClass::UserTask, vec![json!(3)]),
                node("join", NodeClass::ParallelGateway, vec![]),
                node("end", NodeClass::End, vec![]),
            ],
            edges: vec![
                edge("e1", "start", "fork"),
                edge("e2", "fork", "legal"),
                edge("e3", "fork", "finance"),
                edge("e4", "legal", "join"),
                edge("e5", "finance", "join"),
                edge("e6", "join", "end"),
            ],
        },
    };

    let store = Arc::new(MemoryStore::new(vec![process]));
    let eng = engine(store.clone());
    let wo = eng
        .create(CreateWorkOrderRequest { process_id: 2, ..create_req() })
        .await
        .unwrap();
    assert_eq!(wo.state.len(), 2);

    let after_legal = eng
        .handle(HandleWorkOrderRequest {
            work_order_id: wo.id,
            node_id: "legal".into(),
            acting_user: ActingUser { id: 2 },
            circulation: "同意".into(),
            remarks: String::new(),
            form_updates: vec![],
            is_exec_task: false,
            tasks: vec![],
        })
        .await
        .unwrap();
    // Legal's branch is now parked at the join, waiting on finance.
    assert!(!after_legal.is_end);
    assert!(after_legal.active_state("finance").is_some());

    let after_finance = eng
        .handle(HandleWorkOrderRequest {
            work_order_id: wo.id,
            node_id: "finance".into(),
            acting_user: ActingUser { id: 3 },
            circulation: "同意".into(),
            remarks: String::new(),
            form_updates: vec![],
            is_exec_task: false,
            tasks: vec![],
        })
        .await
        .unwrap();
    assert!(after_finance.is_end);
}
