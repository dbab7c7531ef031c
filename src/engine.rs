//! Transition engine (C5): create, handle, gateway routing, join, and
//! terminal detection.
//!
//! Mirrors `original_source`'s `CreateWorkOrder`/`ProcessWorkOrder` handlers:
//! a single edge is followed out of the node being left, and if the node
//! it leads to is itself a gateway, routing continues one level deeper in
//! the same step (exclusive gateways pick first matching edge; parallel
//! forks fan out to every outgoing edge). A plain task node stops there.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::authz::{self, ActingUser};
use crate::condition::edge_matches;
use crate::error::{EngineError, EngineResult};
use crate::graph::{Graph, GraphNode, NodeClass};
use crate::notify::{self, Dispatcher, NotifyIntent};
use crate::resolver::{self, AssigneeContext, UserDirectory};
use crate::state::{cost_duration_since_last_foreign_source, ActiveState, CirculationHistory, TemplateData, WorkOrder};
use crate::store::ProcessStore;
use crate::tasks::{TaskRunner, TaskSubmission};

/// Marker used on a pending `ActiveState` waiting at a parallel join for its
/// sibling branches to arrive. Never exposed to callers as a handle-able
/// position (see `WorkOrder::active_state` callers, which only look up
/// ordinary node ids, and `query`/`authz`, which never treat it as an
/// assignable processor set).
const JOIN_WAIT_MARKER: &str = "__join_wait__";

enum JoinOutcome {
    StillWaiting(ActiveState),
    Advanced { states: Vec<ActiveState>, nodes: Vec<GraphNode> },
}

pub struct CreateWorkOrderRequest {
    pub process_id: i64,
    pub creator: i64,
    pub title: String,
    pub priority: i64,
    pub classify: i64,
    pub related_person: Vec<i64>,
    /// One (form_structure, form_data) pair per submitted template.
    pub templates: Vec<(Value, Value)>,
    /// Whether this work order also drives an external task system.
    pub is_exec_task: bool,
    /// External task identifiers submitted once the create transaction has
    /// committed; ignored unless `is_exec_task` is set.
    pub tasks: Vec<String>,
}

pub struct HandleWorkOrderRequest {
    pub work_order_id: i64,
    pub node_id: String,
    pub acting_user: ActingUser,
    pub circulation: String,
    pub remarks: String,
    /// Replacement form_data values, keyed by template_data id, applied
    /// before condition evaluation and assignee resolution.
    pub form_updates: Vec<(i64, Value)>,
    pub is_exec_task: bool,
    pub tasks: Vec<String>,
}

pub struct Engine<S: ProcessStore> {
    store: Arc<S>,
    directory: Arc<dyn UserDirectory>,
    dispatcher: Option<Arc<Dispatcher>>,
    task_runner: Option<Arc<dyn TaskRunner>>,
    admin_role_id: i64,
}

impl<S: ProcessStore> Engine<S> {
    pub fn new(
        store: Arc<S>,
        directory: Arc<dyn UserDirectory>,
        dispatcher: Option<Arc<Dispatcher>>,
        task_runner: Option<Arc<dyn TaskRunner>>,
        admin_role_id: i64,
    ) -> Self {
        Engine { store, directory, dispatcher, task_runner, admin_role_id }
    }

    pub async fn create(&self, req: CreateWorkOrderRequest) -> EngineResult<WorkOrder> {
        let process = self.store.load_process(req.process_id).await?;
        process.graph.validate()?;

        let start = process.graph.start_node()?;
        let start_edges = process.graph.edges_from(&start.id);
        let entry_edge = match start_edges.as_slice() {
            [single] => single,
            _ => {
                return Err(EngineError::GraphMalformed(
                    "start node must have exactly one outgoing edge".into(),
                ))
            }
        };

        let form_values: Vec<&Value> = req.templates.iter().map(|(_, data)| data).collect();
        let merged_form_data = resolver::merge_form_data(&form_values);

        let entry_nodes = self.switch_class(&process.graph, &entry_edge.target, &merged_form_data, req.work_order_id_for_errors())?;
        let context = AssigneeContext { creator_id: req.creator, acting_user_id: Some(req.creator) };
        let mut active_states = Vec::new();
        for node in &entry_nodes {
            active_states.push(self.build_active_state(node, &merged_form_data, &context).await?);
        }

        let template_data = req
            .templates
            .iter()
            .map(|(structure, data)| TemplateData {
                id: 0,
                work_order_id: 0,
                form_structure: structure.clone(),
                form_data: data.clone(),
            })
            .collect();

        let first_target = active_states.first().map(|s| s.node_id.clone());
        let history = CirculationHistory {
            id: 0,
            work_order_id: 0,
            source: None,
            target: first_target,
            state_label: active_states.first().map(|s| s.label.clone()).unwrap_or_default(),
            circulation: "新建".into(),
            status: 2,
            remarks: String::new(),
            cost_duration: None,
            operator: req.creator,
            create_time: Utc::now(),
        };

        let work_order = WorkOrder {
            id: 0,
            process_id: req.process_id,
            title: req.title,
            priority: req.priority,
            creator: req.creator,
            related_person: req.related_person,
            state: active_states,
            is_end: false,
            classify: req.classify,
            urge_count: 0,
            urge_last_time: None,
            create_time: Utc::now(),
        };

        let saved = self.store.create_work_order(work_order, template_data, history).await?;
        tracing::info!(work_order_id = saved.id, process_id = req.process_id, "work order created");

        let dispatch_nodes: Vec<GraphNode> = entry_nodes.into_iter().cloned().collect();
        self.dispatch_notifications(&saved, &dispatch_nodes, &merged_form_data, &process.notice).await;

        if req.is_exec_task {
            self.dispatch_tasks(saved.id, saved.title.clone(), saved.priority, merged_form_data.clone(), req.tasks);
        }

        Ok(saved)
    }

    pub async fn handle(&self, req: HandleWorkOrderRequest) -> EngineResult<WorkOrder> {
        // Authorization runs before the transaction opens and never mutates
        // state, matching `JudgeUserAuthority` being called ahead of
        // `HandleWorkOrder` in the original service.
        let readable = self.store.get_work_order(req.work_order_id).await?;
        authz::require_handle(&readable, &req.node_id, req.acting_user, self.admin_role_id, &*self.directory).await?;

        let mut work_order = self.store.lock_work_order(req.work_order_id).await?;
        if work_order.is_end {
            return Err(EngineError::AlreadyClosed(work_order.id));
        }
        let handled_index = work_order
            .state
            .iter()
            .position(|s| s.node_id == req.node_id)
            .ok_or(EngineError::StateNotActive(work_order.id))?;

        let process = self.store.load_process(work_order.process_id).await?;
        let graph = &process.graph;
        let node = graph
            .node(&req.node_id)
            .ok_or_else(|| EngineError::GraphMalformed(format!("active node {} missing from graph", req.node_id)))?;

        let mut templates = self.store.list_template_data(work_order.id).await?;
        for (template_id, new_data) in &req.form_updates {
            if let Some(t) = templates.iter_mut().find(|t| t.id == *template_id) {
                t.form_data = new_data.clone();
            }
        }
        let form_values: Vec<&Value> = templates.iter().map(|t| &t.form_data).collect();
        let merged_form_data = resolver::merge_form_data(&form_values);

        let edges = graph.edges_from(&req.node_id);
        let edge = match edges.as_slice() {
            [single] => single,
            [] => return Err(EngineError::GraphMalformed(format!("node {} has no outgoing edge", node.id))),
            _ => {
                return Err(EngineError::GraphMalformed(format!(
                    "node {} has multiple outgoing edges but is not a gateway",
                    node.id
                )))
            }
        };

        let resolved = self.switch_class(graph, &edge.target, &merged_form_data, work_order.id)?;
        let target_node_id = resolved.first().map(|n| n.id.clone());

        let context = AssigneeContext { creator_id: work_order.creator, acting_user_id: Some(req.acting_user.id) };
        let mut new_active_states = Vec::new();
        let mut notify_nodes = Vec::new();
        let mut consumed_join_ids: Vec<String> = Vec::new();
        for candidate in resolved {
            if graph.is_join(&candidate.id) {
                match self.advance_through_join(graph, &work_order, candidate, &merged_form_data, &context).await? {
                    JoinOutcome::StillWaiting(marker) => new_active_states.push(marker),
                    JoinOutcome::Advanced { states, nodes } => {
                        consumed_join_ids.push(candidate.id.clone());
                        new_active_states.extend(states);
                        notify_nodes.extend(nodes);
                    }
                }
            } else if candidate.clazz == NodeClass::End {
                // End nodes consume the branch; nothing becomes active.
            } else {
                new_active_states.push(self.build_active_state(candidate, &merged_form_data, &context).await?);
                notify_nodes.push(candidate.clone());
            }
        }

        work_order.state.remove(handled_index);
        work_order.state.retain(|s| {
            // Drop the join-wait markers for any join that just completed —
            // the branches they represented have now all arrived.
            !(s.process_method.as_deref() == Some(JOIN_WAIT_MARKER) && consumed_join_ids.contains(&s.node_id))
        });
        work_order.state.extend(new_active_states);
        if work_order.state.is_empty() {
            work_order.is_end = true;
        }

        let history_rows = self.store.list_history(work_order.id).await?;
        let cost_duration = cost_duration_since_last_foreign_source(&history_rows, &req.node_id, Utc::now());

        let history = CirculationHistory {
            id: 0,
            work_order_id: work_order.id,
            source: Some(req.node_id.clone()),
            target: target_node_id,
            state_label: node.label.clone(),
            circulation: req.circulation,
            status: 2,
            remarks: req.remarks,
            cost_duration,
            operator: req.acting_user.id,
            create_time: Utc::now(),
        };

        self.store.commit_transition(work_order.clone(), history).await?;
        tracing::info!(work_order_id = work_order.id, node_id = %req.node_id, "work order handled");

        self.dispatch_notifications(&work_order, &notify_nodes, &merged_form_data, &process.notice).await;

        if req.is_exec_task {
            self.dispatch_tasks(work_order.id, work_order.title.clone(), work_order.priority, merged_form_data.clone(), req.tasks);
        }

        Ok(work_order)
    }

    /// Resolves the node an edge leads to, expanding at most one level of
    /// gateway class-switching: exclusive gateways pick their first
    /// matching outgoing edge, parallel forks fan out to every outgoing
    /// edge, everything else (tasks, joins, end nodes) is returned as-is.
    fn switch_class<'g>(
        &self,
        graph: &'g Graph,
        node_id: &str,
        form_data: &Value,
        work_order_id: i64,
    ) -> EngineResult<Vec<&'g GraphNode>> {
        let node = graph
            .node(node_id)
            .ok_or_else(|| EngineError::GraphMalformed(format!("unknown node {node_id}")))?;

        match node.clazz {
            NodeClass::ExclusiveGateway => {
                for edge in graph.edges_from(node_id) {
                    if edge_matches(&edge.condition_expression, form_data) {
                        return Ok(vec![graph.node(&edge.target).ok_or_else(|| {
                            EngineError::GraphMalformed(format!("unknown node {}", edge.target))
                        })?]);
                    }
                }
                Err(EngineError::NoMatchingRoute { work_order_id, node_id: node_id.to_string() })
            }
            NodeClass::ParallelGateway if graph.is_fork(node_id) => {
                let targets: Result<Vec<&GraphNode>, EngineError> = graph
                    .edges_from(node_id)
                    .into_iter()
                    .map(|e| {
                        graph
                            .node(&e.target)
                            .ok_or_else(|| EngineError::GraphMalformed(format!("unknown node {}", e.target)))
                    })
                    .collect();
                targets
            }
            _ => Ok(vec![node]),
        }
    }

    /// Folds one branch's arrival at a join node into the pending-count
    /// map kept as `__join_wait__` markers on the work order, advancing
    /// past the join only once every inbound edge has been accounted for.
    async fn advance_through_join<'g>(
        &self,
        graph: &'g Graph,
        work_order: &WorkOrder,
        join_node: &'g GraphNode,
        form_data: &Value,
        context: &AssigneeContext,
    ) -> EngineResult<JoinOutcome> {
        let expected = graph.edges_to(&join_node.id).len();
        let already_arrived = work_order
            .state
            .iter()
            .filter(|s| s.node_id == join_node.id && s.process_method.as_deref() == Some(JOIN_WAIT_MARKER))
            .count();
        let arrived_now = already_arrived + 1;

        if arrived_now < expected {
            let marker = ActiveState {
                node_id: join_node.id.clone(),
                label: join_node.label.clone(),
                processor: vec![],
                process_method: Some(JOIN_WAIT_MARKER.to_string()),
            };
            return Ok(JoinOutcome::StillWaiting(marker));
        }

        let join_out = graph.edges_from(&join_node.id);
        let out_edge = join_out
            .first()
            .ok_or_else(|| EngineError::GraphMalformed(format!("join {} has no outgoing edge", join_node.id)))?;
        let resolved = self.switch_class(graph, &out_edge.target, form_data, work_order.id)?;

        let mut states = Vec::new();
        let mut nodes = Vec::new();
        for node in resolved {
            if node.clazz == NodeClass::End {
                continue;
            }
            states.push(self.build_active_state(node, form_data, context).await?);
            nodes.push(node.clone());
        }
        Ok(JoinOutcome::Advanced { states, nodes })
    }

    async fn build_active_state(
        &self,
        node: &GraphNode,
        form_data: &Value,
        context: &AssigneeContext,
    ) -> EngineResult<ActiveState> {
        let processor = resolver::resolve_processor(
            node.process_method.as_deref(),
            &node.processor,
            context,
            &*self.directory,
        )
        .await?;
        if node.clazz.requires_assignee() && processor.is_empty() {
            return Err(EngineError::AssigneeEmpty { node_id: node.id.clone() });
        }
        Ok(ActiveState {
            node_id: node.id.clone(),
            label: node.label.clone(),
            processor,
            process_method: node.process_method.clone(),
        })
    }

    async fn dispatch_notifications(
        &self,
        work_order: &WorkOrder,
        nodes: &[GraphNode],
        form_data: &Value,
        notice_channels: &[i64],
    ) {
        let Some(dispatcher) = &self.dispatcher else { return };
        let creator_name = self.directory.display_name(work_order.creator).await.ok().flatten();
        for node in nodes {
            let to_user_ids: Vec<i64> = work_order
                .active_state(&node.id)
                .map(|s| s.processor.iter().filter_map(|v| v.as_i64()).collect())
                .unwrap_or_default();
            let mut intent: NotifyIntent = notify::build_intent(
                work_order,
                node,
                to_user_ids,
                form_data,
                notice_channels,
                creator_name.clone(),
            );
            intent.cc_emails = notify::resolve_cc_emails(node, &*self.directory).await;
            dispatcher.dispatch(intent);
        }
    }

    /// Submits exec-task identifiers on a detached task, mirroring the
    /// original service's `go ExecTask(...)` — a failure here never rolls
    /// back the transition that already committed.
    fn dispatch_tasks(&self, work_order_id: i64, title: String, priority: i64, form_data: Value, task_ids: Vec<String>) {
        let Some(runner) = self.task_runner.clone() else { return };
        if task_ids.is_empty() {
            return;
        }
        tokio::spawn(async move {
            runner
                .submit(&task_ids, TaskSubmission { work_order_id, title, priority, form_data })
                .await;
        });
    }
}

impl CreateWorkOrderRequest {
    fn work_order_id_for_errors(&self) -> i64 {
        // Not yet assigned at this point in `create`; 0 is an unambiguous
        // "no id yet" sentinel for the `NoMatchingRoute` error payload.
        0
    }
}
