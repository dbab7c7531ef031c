//! Persistence & history (C6): the storage seam the engine writes through,
//! plus an in-memory implementation for tests and an optional Postgres
//! implementation for production.
//!
//! Transactional scope: `create_work_order` and `commit_transition` each
//! write the work order's state, its circulation-history row, and (for
//! create) the submitted template data and the process's submit counter,
//! as a single atomic unit. `lock_work_order` takes the row-level lock a
//! caller must hold for the remainder of a handle/lifecycle critical
//! section (`SELECT ... FOR UPDATE` under Postgres).

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::graph::Process;
use crate::query::{WorkOrderFilter, WorkOrderPage};
use crate::state::{ActiveState, CirculationHistory, TemplateData, WorkOrder};

#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn load_process(&self, process_id: i64) -> EngineResult<Process>;
    async fn increment_submit_count(&self, process_id: i64) -> EngineResult<()>;

    /// Read without locking.
    async fn get_work_order(&self, id: i64) -> EngineResult<WorkOrder>;

    /// Acquire the row lock a handle/lifecycle critical section holds for
    /// its duration. Backed by `SELECT ... FOR UPDATE` under Postgres; the
    /// in-memory store serializes through its own mutex instead.
    async fn lock_work_order(&self, id: i64) -> EngineResult<WorkOrder>;

    async fn list_template_data(&self, work_order_id: i64) -> EngineResult<Vec<TemplateData>>;
    async fn list_history(&self, work_order_id: i64) -> EngineResult<Vec<CirculationHistory>>;

    async fn create_work_order(
        &self,
        work_order: WorkOrder,
        template_data: Vec<TemplateData>,
        history: CirculationHistory,
    ) -> EngineResult<WorkOrder>;

    /// Atomically persist a state transition and append its history row.
    async fn commit_transition(
        &self,
        work_order: WorkOrder,
        history: CirculationHistory,
    ) -> EngineResult<()>;

    /// Replace the state column directly with no validation and no history
    /// row — used by ActiveClaim (spec.md §4.8).
    async fn overwrite_state(&self, id: i64, state: Vec<ActiveState>) -> EngineResult<()>;

    async fn set_urge(&self, id: i64, urge_count: i64, urge_last_time: i64) -> EngineResult<()>;
    async fn set_is_end(&self, id: i64) -> EngineResult<()>;
    async fn delete_work_order(&self, id: i64) -> EngineResult<()>;

    async fn list_work_orders(&self, filter: &WorkOrderFilter) -> EngineResult<WorkOrderPage>;
}

pub mod memory {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        processes: Vec<Process>,
        work_orders: Vec<WorkOrder>,
        template_data: Vec<TemplateData>,
        history: Vec<CirculationHistory>,
        next_work_order_id: i64,
        next_template_id: i64,
        next_history_id: i64,
    }

    /// `tests/` and doctests run against this rather than a live database.
    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    impl MemoryStore {
        pub fn new(processes: Vec<Process>) -> Self {
            MemoryStore {
                inner: Mutex::new(Inner {
                    processes,
                    work_orders: vec![],
                    template_data: vec![],
                    history: vec![],
                    next_work_order_id: 1,
                    next_template_id: 1,
                    next_history_id: 1,
                }),
            }
        }
    }

    #[async_trait]
    impl ProcessStore for MemoryStore {
        async fn load_process(&self, process_id: i64) -> EngineResult<Process> {
            let inner = self.inner.lock().unwrap();
            inner
                .processes
                .iter()
                .find(|p| p.id == process_id)
                .cloned()
                .ok_or(EngineError::NotFound { what: "process", id: process_id.to_string() })
        }

        async fn increment_submit_count(&self, process_id: i64) -> EngineResult<()> {
            let mut inner = self.inner.lock().unwrap();
            let process = inner
                .processes
                .iter_mut()
                .find(|p| p.id == process_id)
                .ok_or(EngineError::NotFound { what: "process", id: process_id.to_string() })?;
            process.submit_count += 1;
            Ok(())
        }

        async fn get_work_order(&self, id: i64) -> EngineResult<WorkOrder> {
            let inner = self.inner.lock().unwrap();
            inner
                .work_orders
                .iter()
                .find(|w| w.id == id)
                .cloned()
                .ok_or(EngineError::NotFound { what: "work order", id: id.to_string() })
        }

        async fn lock_work_order(&self, id: i64) -> EngineResult<WorkOrder> {
            // The mutex guarding `inner` is itself the serialization point;
            // by the time this returns, no concurrent writer can be mid-update.
            self.get_work_order(id).await
        }

        async fn list_template_data(&self, work_order_id: i64) -> EngineResult<Vec<TemplateData>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .template_data
                .iter()
                .filter(|t| t.work_order_id == work_order_id)
                .cloned()
                .collect())
        }

        async fn list_history(&self, work_order_id: i64) -> EngineResult<Vec<CirculationHistory>> {
            let inner = self.inner.lock().unwrap();
            let mut rows: Vec<CirculationHistory> = inner
                .history
                .iter()
                .filter(|h| h.work_order_id == work_order_id)
                .cloned()
                .collect();
            rows.sort_by(|a, b| b.create_time.cmp(&a.create_time));
            Ok(rows)
        }

        async fn create_work_order(
            &self,
            mut work_order: WorkOrder,
            mut template_data: Vec<TemplateData>,
            mut history: CirculationHistory,
        ) -> EngineResult<WorkOrder> {
            let mut inner = self.inner.lock().unwrap();
            work_order.id = inner.next_work_order_id;
            inner.next_work_order_id += 1;

            for t in &mut template_data {
                t.id = inner.next_template_id;
                t.work_order_id = work_order.id;
                inner.next_template_id += 1;
            }

            history.id = inner.next_history_id;
            inner.next_history_id += 1;
            history.work_order_id = work_order.id;

            let process_id = work_order.process_id;
            inner.work_orders.push(work_order.clone());
            inner.template_data.extend(template_data);
            inner.history.push(history);
            if let Some(process) = inner.processes.iter_mut().find(|p| p.id == process_id) {
                process.submit_count += 1;
            }
            Ok(work_order)
        }

        async fn commit_transition(
            &self,
            work_order: WorkOrder,
            mut history: CirculationHistory,
        ) -> EngineResult<()> {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner
                .work_orders
                .iter_mut()
                .find(|w| w.id == work_order.id)
                .ok_or(EngineError::NotFound { what: "work order", id: work_order.id.to_string() })?;
            *slot = work_order;

            history.id = inner.next_history_id;
            inner.next_history_id += 1;
            inner.history.push(history);
            Ok(())
        }

        async fn overwrite_state(&self, id: i64, state: Vec<ActiveState>) -> EngineResult<()> {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner
                .work_orders
                .iter_mut()
                .find(|w| w.id == id)
                .ok_or(EngineError::NotFound { what: "work order", id: id.to_string() })?;
            slot.state = state;
            Ok(())
        }

        async fn set_urge(&self, id: i64, urge_count: i64, urge_last_time: i64) -> EngineResult<()> {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner
                .work_orders
                .iter_mut()
                .find(|w| w.id == id)
                .ok_or(EngineError::NotFound { what: "work order", id: id.to_string() })?;
            slot.urge_count = urge_count;
            slot.urge_last_time = Some(urge_last_time);
            Ok(())
        }

        async fn set_is_end(&self, id: i64) -> EngineResult<()> {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner
                .work_orders
                .iter_mut()
                .find(|w| w.id == id)
                .ok_or(EngineError::NotFound { what: "work order", id: id.to_string() })?;
            slot.is_end = true;
            Ok(())
        }

        async fn delete_work_order(&self, id: i64) -> EngineResult<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.work_orders.retain(|w| w.id != id);
            Ok(())
        }

        async fn list_work_orders(&self, filter: &WorkOrderFilter) -> EngineResult<WorkOrderPage> {
            let inner = self.inner.lock().unwrap();
            let mut matched: Vec<WorkOrder> = inner
                .work_orders
                .iter()
                .filter(|w| filter.matches(w))
                .cloned()
                .collect();
            matched.sort_by(|a, b| b.id.cmp(&a.id));
            let total = matched.len() as i64;
            let start = ((filter.page - 1).max(0) * filter.per_page) as usize;
            let page_items = matched
                .into_iter()
                .skip(start)
                .take(filter.per_page as usize)
                .collect();
            Ok(WorkOrderPage { items: page_items, total })
        }
    }
}

#[cfg(feature = "database")]
pub mod postgres {
    use super::*;
    use sqlx::{PgPool, Row};

    /// Backs `ProcessStore` with Postgres, using `SELECT ... FOR UPDATE` for
    /// `lock_work_order` and a single `sqlx::Transaction` per write method,
    /// in the upsert/bind style `store_postgres.rs` uses for its instance
    /// table.
    pub struct PostgresStore {
        pool: PgPool,
    }

    impl PostgresStore {
        pub fn new(pool: PgPool) -> Self {
            PostgresStore { pool }
        }
    }

    #[async_trait]
    impl ProcessStore for PostgresStore {
        async fn load_process(&self, process_id: i64) -> EngineResult<Process> {
            let row = sqlx::query("SELECT id, name, graph, submit_count, notice FROM p_process WHERE id = $1")
                .bind(process_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(EngineError::NotFound { what: "process", id: process_id.to_string() })?;
            let graph_json: serde_json::Value = row.try_get("graph")?;
            let notice_json: serde_json::Value = row.try_get("notice")?;
            Ok(Process {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                graph: serde_json::from_value(graph_json)
                    .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?,
                submit_count: row.try_get("submit_count")?,
                notice: serde_json::from_value(notice_json)
                    .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?,
            })
        }

        async fn increment_submit_count(&self, process_id: i64) -> EngineResult<()> {
            sqlx::query("UPDATE p_process SET submit_count = submit_count + 1 WHERE id = $1")
                .bind(process_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn get_work_order(&self, id: i64) -> EngineResult<WorkOrder> {
            self.fetch_work_order(id, false).await
        }

        async fn lock_work_order(&self, id: i64) -> EngineResult<WorkOrder> {
            self.fetch_work_order(id, true).await
        }

        async fn list_template_data(&self, work_order_id: i64) -> EngineResult<Vec<TemplateData>> {
            let rows = sqlx::query(
                "SELECT id, work_order_id, form_structure, form_data \
                 FROM p_work_order_tpl_data WHERE work_order_id = $1",
            )
            .bind(work_order_id)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter()
                .map(|row| {
                    Ok(TemplateData {
                        id: row.try_get("id")?,
                        work_order_id: row.try_get("work_order_id")?,
                        form_structure: row.try_get("form_structure")?,
                        form_data: row.try_get("form_data")?,
                    })
                })
                .collect()
        }

        async fn list_history(&self, work_order_id: i64) -> EngineResult<Vec<CirculationHistory>> {
            let rows = sqlx::query(
                "SELECT id, work_order_id, source, target, state_label, circulation, status, \
                        remarks, cost_duration, operator, create_time \
                 FROM p_work_order_circulation_history \
                 WHERE work_order_id = $1 ORDER BY create_time DESC",
            )
            .bind(work_order_id)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(row_to_history).collect()
        }

        async fn create_work_order(
            &self,
            mut work_order: WorkOrder,
            mut template_data: Vec<TemplateData>,
            mut history: CirculationHistory,
        ) -> EngineResult<WorkOrder> {
            let mut tx = self.pool.begin().await?;

            let state_json = serde_json::to_value(&work_order.state)
                .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
            let related_person_json = serde_json::to_value(&work_order.related_person)
                .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO p_work_order_info \
                 (process_id, title, priority, creator, related_person, state, is_end, classify, \
                  urge_count, urge_last_time, create_time) \
                 VALUES ($1, $2, $3, $4, $5, $6, false, $7, 0, NULL, now()) \
                 RETURNING id",
            )
            .bind(work_order.process_id)
            .bind(&work_order.title)
            .bind(work_order.priority)
            .bind(work_order.creator)
            .bind(related_person_json)
            .bind(state_json)
            .bind(work_order.classify)
            .fetch_one(&mut *tx)
            .await?;
            work_order.id = id;

            for t in &mut template_data {
                t.work_order_id = id;
                let tid: i64 = sqlx::query_scalar(
                    "INSERT INTO p_work_order_tpl_data (work_order_id, form_structure, form_data) \
                     VALUES ($1, $2, $3) RETURNING id",
                )
                .bind(id)
                .bind(&t.form_structure)
                .bind(&t.form_data)
                .fetch_one(&mut *tx)
                .await?;
                t.id = tid;
            }

            history.work_order_id = id;
            insert_history(&mut tx, &mut history).await?;

            sqlx::query("UPDATE p_process SET submit_count = submit_count + 1 WHERE id = $1")
                .bind(work_order.process_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(work_order)
        }

        async fn commit_transition(
            &self,
            work_order: WorkOrder,
            mut history: CirculationHistory,
        ) -> EngineResult<()> {
            let mut tx = self.pool.begin().await?;
            let state_json = serde_json::to_value(&work_order.state)
                .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
            sqlx::query("UPDATE p_work_order_info SET state = $1, is_end = $2 WHERE id = $3")
                .bind(state_json)
                .bind(work_order.is_end)
                .bind(work_order.id)
                .execute(&mut *tx)
                .await?;
            history.work_order_id = work_order.id;
            insert_history(&mut tx, &mut history).await?;
            tx.commit().await?;
            Ok(())
        }

        async fn overwrite_state(&self, id: i64, state: Vec<ActiveState>) -> EngineResult<()> {
            let state_json = serde_json::to_value(&state)
                .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?;
            sqlx::query("UPDATE p_work_order_info SET state = $1 WHERE id = $2")
                .bind(state_json)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn set_urge(&self, id: i64, urge_count: i64, urge_last_time: i64) -> EngineResult<()> {
            sqlx::query(
                "UPDATE p_work_order_info SET urge_count = $1, urge_last_time = $2 WHERE id = $3",
            )
            .bind(urge_count)
            .bind(urge_last_time)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn set_is_end(&self, id: i64) -> EngineResult<()> {
            sqlx::query("UPDATE p_work_order_info SET is_end = true WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn delete_work_order(&self, id: i64) -> EngineResult<()> {
            sqlx::query("DELETE FROM p_work_order_info WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn list_work_orders(&self, filter: &WorkOrderFilter) -> EngineResult<WorkOrderPage> {
            // The original query joins against a hardcoded template-class id
            // via JSON_EXTRACT; Postgres expresses the same join with `->>`.
            let offset = (filter.page - 1).max(0) * filter.per_page;
            let rows = sqlx::query(
                "SELECT wo.id, wo.process_id, wo.title, wo.priority, wo.creator, \
                        wo.related_person, wo.state, wo.is_end, wo.classify, \
                        wo.urge_count, wo.urge_last_time, wo.create_time \
                 FROM p_work_order_info wo \
                 LEFT JOIN p_work_order_tpl_data td ON td.work_order_id = wo.id \
                 WHERE ($1::bigint IS NULL OR wo.creator = $1) \
                   AND ($2::bool IS NULL OR wo.is_end = $2) \
                   AND ($3::text IS NULL OR wo.title ILIKE '%' || $3 || '%') \
                   AND ($4::bigint IS NULL OR wo.priority = $4) \
                   AND ($5::timestamptz IS NULL OR wo.create_time >= $5) \
                   AND ($6::timestamptz IS NULL OR wo.create_time <= $6) \
                   AND ($7::bigint IS NULL OR EXISTS ( \
                       SELECT 1 FROM jsonb_array_elements(wo.state) elem \
                       WHERE elem->'processor' @> to_jsonb(ARRAY[$7::bigint]))) \
                 ORDER BY wo.id DESC \
                 LIMIT $8 OFFSET $9",
            )
            .bind(filter.creator)
            .bind(filter.is_end)
            .bind(&filter.title_contains)
            .bind(filter.priority)
            .bind(filter.start_time)
            .bind(filter.end_time)
            .bind(filter.processor)
            .bind(filter.per_page)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
            let items = rows.into_iter().map(row_to_work_order).collect::<EngineResult<Vec<_>>>()?;

            let total: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM p_work_order_info wo \
                 WHERE ($1::bigint IS NULL OR wo.creator = $1) \
                   AND ($2::bool IS NULL OR wo.is_end = $2) \
                   AND ($3::text IS NULL OR wo.title ILIKE '%' || $3 || '%') \
                   AND ($4::bigint IS NULL OR wo.priority = $4) \
                   AND ($5::timestamptz IS NULL OR wo.create_time >= $5) \
                   AND ($6::timestamptz IS NULL OR wo.create_time <= $6) \
                   AND ($7::bigint IS NULL OR EXISTS ( \
                       SELECT 1 FROM jsonb_array_elements(wo.state) elem \
                       WHERE elem->'processor' @> to_jsonb(ARRAY[$7::bigint])))",
            )
            .bind(filter.creator)
            .bind(filter.is_end)
            .bind(&filter.title_contains)
            .bind(filter.priority)
            .bind(filter.start_time)
            .bind(filter.end_time)
            .bind(filter.processor)
            .fetch_one(&self.pool)
            .await?;

            Ok(WorkOrderPage { items, total })
        }
    }

    impl PostgresStore {
        async fn fetch_work_order(&self, id: i64, for_update: bool) -> EngineResult<WorkOrder> {
            let sql = if for_update {
                "SELECT id, process_id, title, priority, creator, related_person, state, is_end, \
                        classify, urge_count, urge_last_time, create_time \
                 FROM p_work_order_info WHERE id = $1 FOR UPDATE"
            } else {
                "SELECT id, process_id, title, priority, creator, related_person, state, is_end, \
                        classify, urge_count, urge_last_time, create_time \
                 FROM p_work_order_info WHERE id = $1"
            };
            let row = sqlx::query(sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(EngineError::NotFound { what: "work order", id: id.to_string() })?;
            row_to_work_order(row)
        }
    }

    fn row_to_work_order(row: sqlx::postgres::PgRow) -> EngineResult<WorkOrder> {
        let related_person_json: serde_json::Value = row.try_get("related_person")?;
        let state_json: serde_json::Value = row.try_get("state")?;
        Ok(WorkOrder {
            id: row.try_get("id")?,
            process_id: row.try_get("process_id")?,
            title: row.try_get("title")?,
            priority: row.try_get("priority")?,
            creator: row.try_get("creator")?,
            related_person: serde_json::from_value(related_person_json)
                .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?,
            state: serde_json::from_value(state_json)
                .map_err(|e| EngineError::PersistenceFailure(e.to_string()))?,
            is_end: row.try_get("is_end")?,
            classify: row.try_get("classify")?,
            urge_count: row.try_get("urge_count")?,
            urge_last_time: row.try_get("urge_last_time")?,
            create_time: row.try_get("create_time")?,
        })
    }

    fn row_to_history(row: sqlx::postgres::PgRow) -> EngineResult<CirculationHistory> {
        Ok(CirculationHistory {
            id: row.try_get("id")?,
            work_order_id: row.try_get("work_order_id")?,
            source: row.try_get("source")?,
            target: row.try_get("target")?,
            state_label: row.try_get("state_label")?,
            circulation: row.try_get("circulation")?,
            status: row.try_get("status")?,
            remarks: row.try_get("remarks")?,
            cost_duration: row.try_get("cost_duration")?,
            operator: row.try_get("operator")?,
            create_time: row.try_get("create_time")?,
        })
    }

    async fn insert_history(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        history: &mut CirculationHistory,
    ) -> EngineResult<()> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO p_work_order_circulation_history \
             (work_order_id, source, target, state_label, circulation, status, remarks, \
              cost_duration, operator, create_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now()) RETURNING id",
        )
        .bind(history.work_order_id)
        .bind(&history.source)
        .bind(&history.target)
        .bind(&history.state_label)
        .bind(&history.circulation)
        .bind(history.status)
        .bind(&history.remarks)
        .bind(history.cost_duration)
        .bind(history.operator)
        .fetch_one(&mut **tx)
        .await?;
        history.id = id;
        Ok(())
    }
}
