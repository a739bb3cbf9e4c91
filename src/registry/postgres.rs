//! Postgres-backed `Registry`.
//!
//! Uses `sqlx`'s runtime-checked query API (`query`/`query_as`), not the
//! compile-time `query!`/`query_as!` macros — those require either a live
//! `DATABASE_URL` or a committed `.sqlx` offline cache to typecheck, neither
//! of which this build can produce. Optimistic concurrency on `reserve_kernel`
//! follows the same `UPDATE ... WHERE <guard>` pattern used for session
//! persistence elsewhere in this codebase: the row only changes if the guard
//! still holds, and zero affected rows means a concurrent writer won the race.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::model::{
    Agent, ClusterMode, DomainResourcePolicy, Endpoint, EndpointStage, GroupResourcePolicy, Kernel,
    KeypairResourcePolicy, PolicyDefault, Route, RouteStatus, Session, SessionKind, SessionStatus,
    StatusData, UserResourcePolicy,
};
use crate::resource::ResourceSlots;
use crate::types::{
    AccessKey, AgentId, EndpointId, Error, KernelId, Result, RouteId, ScalingGroupName, SessionId,
};

use super::Registry;

/// `Registry` implementor backed by a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn slots_to_json(slots: &ResourceSlots) -> serde_json::Value {
        serde_json::to_value(slots).unwrap_or(serde_json::Value::Null)
    }

    fn slots_from_json(value: serde_json::Value) -> ResourceSlots {
        serde_json::from_value(value).unwrap_or_default()
    }

    fn status_str(status: SessionStatus) -> &'static str {
        match status {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Scheduled => "SCHEDULED",
            SessionStatus::Preparing => "PREPARING",
            SessionStatus::Prepared => "PREPARED",
            SessionStatus::Creating => "CREATING",
            SessionStatus::Running => "RUNNING",
            SessionStatus::Terminating => "TERMINATING",
            SessionStatus::Terminated => "TERMINATED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Error => "ERROR",
        }
    }

    fn status_from_str(s: &str) -> Result<SessionStatus> {
        Ok(match s {
            "PENDING" => SessionStatus::Pending,
            "SCHEDULED" => SessionStatus::Scheduled,
            "PREPARING" => SessionStatus::Preparing,
            "PREPARED" => SessionStatus::Prepared,
            "CREATING" => SessionStatus::Creating,
            "RUNNING" => SessionStatus::Running,
            "TERMINATING" => SessionStatus::Terminating,
            "TERMINATED" => SessionStatus::Terminated,
            "CANCELLED" => SessionStatus::Cancelled,
            "ERROR" => SessionStatus::Error,
            other => return Err(Error::internal(format!("unknown session status: {other}"))),
        })
    }

    fn endpoint_stage_str(stage: EndpointStage) -> &'static str {
        match stage {
            EndpointStage::Created => "CREATED",
            EndpointStage::Destroying => "DESTROYING",
            EndpointStage::Destroyed => "DESTROYED",
        }
    }

    fn endpoint_stage_from_str(s: &str) -> Result<EndpointStage> {
        Ok(match s {
            "CREATED" => EndpointStage::Created,
            "DESTROYING" => EndpointStage::Destroying,
            "DESTROYED" => EndpointStage::Destroyed,
            other => return Err(Error::internal(format!("unknown endpoint stage: {other}"))),
        })
    }

    fn route_status_str(status: RouteStatus) -> &'static str {
        match status {
            RouteStatus::Provisioning => "PROVISIONING",
            RouteStatus::Healthy => "HEALTHY",
            RouteStatus::Unhealthy => "UNHEALTHY",
            RouteStatus::Terminating => "TERMINATING",
        }
    }

    fn route_status_from_str(s: &str) -> Result<RouteStatus> {
        Ok(match s {
            "PROVISIONING" => RouteStatus::Provisioning,
            "HEALTHY" => RouteStatus::Healthy,
            "UNHEALTHY" => RouteStatus::Unhealthy,
            "TERMINATING" => RouteStatus::Terminating,
            other => return Err(Error::internal(format!("unknown route status: {other}"))),
        })
    }

    fn session_kind_str(kind: SessionKind) -> &'static str {
        match kind {
            SessionKind::Interactive => "INTERACTIVE",
            SessionKind::Batch => "BATCH",
            SessionKind::Inference => "INFERENCE",
        }
    }

    fn session_kind_from_str(s: &str) -> SessionKind {
        match s {
            "BATCH" => SessionKind::Batch,
            "INFERENCE" => SessionKind::Inference,
            _ => SessionKind::Interactive,
        }
    }

    fn cluster_mode_str(mode: ClusterMode) -> &'static str {
        match mode {
            ClusterMode::SingleNode => "SINGLE_NODE",
            ClusterMode::MultiNode => "MULTI_NODE",
        }
    }

    fn cluster_mode_from_str(s: &str) -> ClusterMode {
        match s {
            "MULTI_NODE" => ClusterMode::MultiNode,
            _ => ClusterMode::SingleNode,
        }
    }

    fn policy_default_str(default: PolicyDefault) -> &'static str {
        match default {
            PolicyDefault::Limited => "LIMITED",
            PolicyDefault::Unlimited => "UNLIMITED",
        }
    }

    fn policy_default_from_str(s: &str) -> PolicyDefault {
        match s {
            "LIMITED" => PolicyDefault::Limited,
            _ => PolicyDefault::Unlimited,
        }
    }

    fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<Session> {
        let id: uuid::Uuid = row.try_get("id")?;
        let access_key: String = row.try_get("access_key")?;
        let domain_name: String = row.try_get("domain_name")?;
        let group_name: String = row.try_get("group_name")?;
        let scaling_group: String = row.try_get("scaling_group")?;
        let status: String = row.try_get("status")?;
        let reason: Option<String> = row.try_get("status_reason")?;
        let details: serde_json::Value = row.try_get("status_details")?;
        let priority: i32 = row.try_get("priority")?;
        let kind: String = row.try_get("kind")?;
        let cluster_mode: String = row.try_get("cluster_mode")?;
        let cluster_size: i32 = row.try_get("cluster_size")?;
        let requested_slots: serde_json::Value = row.try_get("requested_slots")?;
        let image: String = row.try_get("image")?;
        let architecture: String = row.try_get("architecture")?;
        let mounts: serde_json::Value = row.try_get("mounts")?;
        let env: serde_json::Value = row.try_get("env")?;
        let preopen_ports: serde_json::Value = row.try_get("preopen_ports")?;
        let dependencies: serde_json::Value = row.try_get("dependencies")?;
        let retries: i32 = row.try_get("retries")?;
        let created_at = row.try_get("created_at")?;
        let starts_at = row.try_get("starts_at")?;
        let running_since = row.try_get("running_since")?;
        let terminated_at = row.try_get("terminated_at")?;
        let consecutive_check_failures: i32 = row.try_get("consecutive_check_failures")?;

        Ok(Session {
            id: SessionId::from_string(id.to_string())
                .map_err(|e| Error::internal(e.to_string()))?,
            access_key: AccessKey::from_string(access_key)
                .map_err(|e| Error::internal(e.to_string()))?,
            domain_name,
            group_name,
            scaling_group: ScalingGroupName::from_string(scaling_group)
                .map_err(|e| Error::internal(e.to_string()))?,
            status: Self::status_from_str(&status)?,
            status_data: StatusData { reason, details },
            priority: crate::model::SchedulingPriority(priority),
            kind: Self::session_kind_from_str(&kind),
            cluster_mode: Self::cluster_mode_from_str(&cluster_mode),
            cluster_size: cluster_size as u32,
            requested_slots: Self::slots_from_json(requested_slots),
            kernels: Vec::new(),
            image,
            architecture,
            mounts: serde_json::from_value(mounts).unwrap_or_default(),
            env: serde_json::from_value(env).unwrap_or_default(),
            preopen_ports: serde_json::from_value(preopen_ports).unwrap_or_default(),
            dependencies: serde_json::from_value::<Vec<String>>(dependencies)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|s| SessionId::from_string(s).ok())
                .collect(),
            retries: retries as u32,
            created_at,
            starts_at,
            running_since,
            terminated_at,
            consecutive_check_failures: consecutive_check_failures as u32,
        })
    }
}

#[async_trait]
impl Registry for PostgresRegistry {
    async fn insert_session(&self, session: Session) -> Result<()> {
        let uuid = uuid::Uuid::parse_str(session.id.as_str())
            .map_err(|e| Error::internal(e.to_string()))?;
        let dependencies: Vec<String> = session
            .dependencies
            .iter()
            .map(|d| d.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO sessions
                (id, access_key, domain_name, group_name, scaling_group, status, status_reason,
                 status_details, priority, kind, cluster_mode, cluster_size, requested_slots,
                 image, architecture, mounts, env, preopen_ports, dependencies, retries, created_at,
                 starts_at, consecutive_check_failures)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23)
            "#,
        )
        .bind(uuid)
        .bind(session.access_key.as_str())
        .bind(&session.domain_name)
        .bind(&session.group_name)
        .bind(session.scaling_group.as_str())
        .bind(Self::status_str(session.status))
        .bind(session.status_data.reason)
        .bind(session.status_data.details)
        .bind(session.priority.0)
        .bind(Self::session_kind_str(session.kind))
        .bind(Self::cluster_mode_str(session.cluster_mode))
        .bind(session.cluster_size as i32)
        .bind(Self::slots_to_json(&session.requested_slots))
        .bind(&session.image)
        .bind(&session.architecture)
        .bind(serde_json::to_value(&session.mounts).unwrap_or_default())
        .bind(serde_json::to_value(&session.env).unwrap_or_default())
        .bind(serde_json::to_value(&session.preopen_ports).unwrap_or_default())
        .bind(serde_json::to_value(&dependencies).unwrap_or_default())
        .bind(session.retries as i32)
        .bind(session.created_at)
        .bind(session.starts_at)
        .bind(session.consecutive_check_failures as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Session> {
        let uuid = uuid::Uuid::parse_str(id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("session {id} not found")))?;
        Self::row_to_session(&row)
    }

    async fn pending_sessions(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE scaling_group = $1 AND status = 'PENDING' ORDER BY created_at ASC",
        )
        .bind(scaling_group.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn active_sessions(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE scaling_group = $1 AND status NOT IN ('TERMINATED', 'CANCELLED')",
        )
        .bind(scaling_group.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn terminated_sessions(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE scaling_group = $1 AND status IN ('TERMINATED', 'CANCELLED')",
        )
        .bind(scaling_group.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn purge_session(&self, id: &SessionId) -> Result<()> {
        let uuid = uuid::Uuid::parse_str(id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM kernels WHERE session_id = $1")
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        let rows = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(uuid)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        if rows == 0 {
            return Err(Error::not_found(format!("session {id} not found")));
        }
        Ok(())
    }

    async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let uuid = uuid::Uuid::parse_str(id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let terminal_at = matches!(status, SessionStatus::Terminated | SessionStatus::Cancelled)
            .then(chrono::Utc::now);
        let running_since =
            matches!(status, SessionStatus::Running).then(chrono::Utc::now);

        let rows = sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2,
                status_reason = $3,
                running_since = COALESCE($4, running_since),
                terminated_at = COALESCE($5, terminated_at)
            WHERE id = $1
            "#,
        )
        .bind(uuid)
        .bind(Self::status_str(status))
        .bind(reason)
        .bind(running_since)
        .bind(terminal_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(Error::not_found(format!("session {id} not found")));
        }
        Ok(())
    }

    async fn record_check_failure(&self, id: &SessionId) -> Result<u32> {
        let uuid = uuid::Uuid::parse_str(id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let row = sqlx::query(
            "UPDATE sessions SET consecutive_check_failures = consecutive_check_failures + 1 WHERE id = $1 RETURNING consecutive_check_failures",
        )
        .bind(uuid)
        .fetch_one(&self.pool)
        .await?;
        let count: i32 = row.try_get("consecutive_check_failures")?;
        Ok(count as u32)
    }

    async fn reset_check_failures(&self, id: &SessionId) -> Result<()> {
        let uuid = uuid::Uuid::parse_str(id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        sqlx::query("UPDATE sessions SET consecutive_check_failures = 0 WHERE id = $1")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_kernel(&self, kernel: Kernel) -> Result<()> {
        let id = uuid::Uuid::parse_str(kernel.id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let session_id = uuid::Uuid::parse_str(kernel.session_id.as_str())
            .map_err(|e| Error::internal(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO kernels (id, session_id, agent_id, status, occupied_slots, image, architecture, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(session_id)
        .bind(kernel.agent_id.as_ref().map(|a| a.as_str().to_string()))
        .bind(Self::status_str(kernel.status))
        .bind(Self::slots_to_json(&kernel.occupied_slots))
        .bind(kernel.image)
        .bind(kernel.architecture)
        .bind(kernel.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_kernel(&self, id: &KernelId) -> Result<Kernel> {
        let uuid = uuid::Uuid::parse_str(id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let row = sqlx::query("SELECT * FROM kernels WHERE id = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("kernel {id} not found")))?;
        row_to_kernel(&row)
    }

    async fn kernels_for_session(&self, session_id: &SessionId) -> Result<Vec<Kernel>> {
        let uuid = uuid::Uuid::parse_str(session_id.as_str())
            .map_err(|e| Error::internal(e.to_string()))?;
        let rows = sqlx::query("SELECT * FROM kernels WHERE session_id = $1")
            .bind(uuid)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_kernel).collect()
    }

    async fn update_kernel_status(&self, id: &KernelId, status: SessionStatus) -> Result<()> {
        let uuid = uuid::Uuid::parse_str(id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        sqlx::query("UPDATE kernels SET status = $2 WHERE id = $1")
            .bind(uuid)
            .bind(Self::status_str(status))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reserve_kernel(&self, kernel_id: &KernelId, agent_id: &AgentId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let kernel_uuid =
            uuid::Uuid::parse_str(kernel_id.as_str()).map_err(|e| Error::internal(e.to_string()))?;

        let kernel_row = sqlx::query("SELECT occupied_slots FROM kernels WHERE id = $1 FOR UPDATE")
            .bind(kernel_uuid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found(format!("kernel {kernel_id} not found")))?;
        let occupied: serde_json::Value = kernel_row.try_get("occupied_slots")?;
        let occupied_slots = Self::slots_from_json(occupied);

        let agent_row = sqlx::query(
            "SELECT available_slots, occupied_slots, container_limit, container_count FROM agents WHERE id = $1 FOR UPDATE",
        )
        .bind(agent_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found(format!("agent {agent_id} not found")))?;

        let available_slots = Self::slots_from_json(agent_row.try_get("available_slots")?);
        let agent_occupied = Self::slots_from_json(agent_row.try_get("occupied_slots")?);
        let container_limit: i32 = agent_row.try_get("container_limit")?;
        let container_count: i32 = agent_row.try_get("container_count")?;

        let remaining = available_slots.subtract(&agent_occupied)?;
        if !occupied_slots.fits_within(&remaining) {
            return Err(Error::capacity(format!(
                "agent {agent_id} has insufficient remaining capacity for kernel {kernel_id}"
            )));
        }
        if container_count >= container_limit {
            return Err(Error::capacity(format!("agent {agent_id} has no container headroom")));
        }

        let new_occupied = agent_occupied.add(&occupied_slots);
        sqlx::query(
            "UPDATE agents SET occupied_slots = $2, container_count = container_count + 1 WHERE id = $1",
        )
        .bind(agent_id.as_str())
        .bind(Self::slots_to_json(&new_occupied))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE kernels SET agent_id = $2 WHERE id = $1")
            .bind(kernel_uuid)
            .bind(agent_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn release_kernel(&self, kernel_id: &KernelId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let kernel_uuid =
            uuid::Uuid::parse_str(kernel_id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let kernel_row = sqlx::query("SELECT agent_id, occupied_slots FROM kernels WHERE id = $1 FOR UPDATE")
            .bind(kernel_uuid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found(format!("kernel {kernel_id} not found")))?;

        let agent_id: Option<String> = kernel_row.try_get("agent_id")?;
        let occupied_slots = Self::slots_from_json(kernel_row.try_get("occupied_slots")?);

        if let Some(agent_id) = agent_id {
            let agent_row = sqlx::query(
                "SELECT occupied_slots, container_count FROM agents WHERE id = $1 FOR UPDATE",
            )
            .bind(&agent_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(agent_row) = agent_row {
                let agent_occupied = Self::slots_from_json(agent_row.try_get("occupied_slots")?);
                let new_occupied = agent_occupied.subtract(&occupied_slots)?;
                sqlx::query(
                    "UPDATE agents SET occupied_slots = $2, container_count = GREATEST(container_count - 1, 0) WHERE id = $1",
                )
                .bind(&agent_id)
                .bind(Self::slots_to_json(&new_occupied))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_agents(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE scaling_group = $1")
            .bind(scaling_group.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn get_agent(&self, id: &AgentId) -> Result<Agent> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("agent {id} not found")))?;
        row_to_agent(&row)
    }

    async fn list_endpoints(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Endpoint>> {
        let rows = sqlx::query("SELECT * FROM endpoints WHERE scaling_group = $1")
            .bind(scaling_group.as_str())
            .fetch_all(&self.pool)
            .await?;
        let mut endpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut endpoint = row_to_endpoint(row)?;
            let route_rows = sqlx::query("SELECT id FROM routes WHERE endpoint_id = $1")
                .bind(uuid::Uuid::parse_str(endpoint.id.as_str()).map_err(|e| Error::internal(e.to_string()))?)
                .fetch_all(&self.pool)
                .await?;
            endpoint.routes = route_rows
                .iter()
                .map(|r| {
                    let id: uuid::Uuid = r.try_get("id")?;
                    RouteId::from_string(id.to_string()).map_err(|e| Error::internal(e.to_string()))
                })
                .collect::<Result<_>>()?;
            endpoints.push(endpoint);
        }
        Ok(endpoints)
    }

    async fn upsert_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        let uuid = uuid::Uuid::parse_str(endpoint.id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO endpoints (id, access_key, scaling_group, lifecycle_stage, replicas, retries)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                lifecycle_stage = $4,
                replicas = $5,
                retries = $6
            "#,
        )
        .bind(uuid)
        .bind(endpoint.access_key.as_str())
        .bind(endpoint.scaling_group.as_str())
        .bind(Self::endpoint_stage_str(endpoint.lifecycle_stage))
        .bind(endpoint.replicas as i32)
        .bind(endpoint.retries as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_endpoint(&self, id: &EndpointId) -> Result<()> {
        let uuid = uuid::Uuid::parse_str(id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let rows = sqlx::query("DELETE FROM endpoints WHERE id = $1")
            .bind(uuid)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(Error::not_found(format!("endpoint {id} not found")));
        }
        Ok(())
    }

    async fn routes_for_endpoint(&self, endpoint_id: &EndpointId) -> Result<Vec<Route>> {
        let uuid =
            uuid::Uuid::parse_str(endpoint_id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let rows = sqlx::query("SELECT * FROM routes WHERE endpoint_id = $1")
            .bind(uuid)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_route).collect()
    }

    async fn insert_route(&self, route: Route) -> Result<()> {
        let id = uuid::Uuid::parse_str(route.id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let endpoint_id = uuid::Uuid::parse_str(route.endpoint_id.as_str())
            .map_err(|e| Error::internal(e.to_string()))?;
        let session_id = route
            .session_id
            .as_ref()
            .map(|s| uuid::Uuid::parse_str(s.as_str()))
            .transpose()
            .map_err(|e| Error::internal(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO routes (id, endpoint_id, session_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(endpoint_id)
        .bind(session_id)
        .bind(Self::route_status_str(route.status))
        .bind(route.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_route_status(&self, id: &RouteId, status: RouteStatus) -> Result<()> {
        let uuid = uuid::Uuid::parse_str(id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        sqlx::query("UPDATE routes SET status = $2 WHERE id = $1")
            .bind(uuid)
            .bind(Self::route_status_str(status))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_route(&self, id: &RouteId) -> Result<()> {
        let uuid = uuid::Uuid::parse_str(id.as_str()).map_err(|e| Error::internal(e.to_string()))?;
        let rows = sqlx::query("DELETE FROM routes WHERE id = $1")
            .bind(uuid)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(Error::not_found(format!("route {id} not found")));
        }
        Ok(())
    }

    async fn upsert_agent(&self, agent: Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents
                (id, addr, scaling_group, architecture, schedulable, available_slots,
                 occupied_slots, container_limit, container_count, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                addr = $2,
                scaling_group = $3,
                architecture = $4,
                schedulable = $5,
                available_slots = $6,
                container_limit = $8,
                last_heartbeat = $10
            "#,
        )
        .bind(agent.id.as_str())
        .bind(agent.addr)
        .bind(agent.scaling_group.as_str())
        .bind(agent.architecture)
        .bind(agent.schedulable)
        .bind(Self::slots_to_json(&agent.available_slots))
        .bind(Self::slots_to_json(&agent.occupied_slots))
        .bind(agent.container_limit as i32)
        .bind(agent.container_count as i32)
        .bind(agent.last_heartbeat)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clean_zombie_routes(&self) -> Result<u32> {
        let rows = sqlx::query(
            r#"
            DELETE FROM routes
            WHERE session_id IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM sessions WHERE sessions.id = routes.session_id)
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows as u32)
    }

    async fn get_keypair_resource_policy(
        &self,
        access_key: &AccessKey,
    ) -> Result<Option<KeypairResourcePolicy>> {
        let row = sqlx::query(
            "SELECT total_resource_slots, default_for_unspecified, max_concurrent_sessions, \
             max_pending_session_count, max_pending_session_resource_slots \
             FROM keypair_resource_policies WHERE access_key = $1",
        )
        .bind(access_key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let total: Option<serde_json::Value> = row.try_get("total_resource_slots")?;
        let default_for_unspecified: String = row.try_get("default_for_unspecified")?;
        let max_concurrent_sessions: Option<i32> = row.try_get("max_concurrent_sessions")?;
        let max_pending_session_count: Option<i32> = row.try_get("max_pending_session_count")?;
        let max_pending: Option<serde_json::Value> =
            row.try_get("max_pending_session_resource_slots")?;
        Ok(Some(KeypairResourcePolicy {
            access_key: access_key.clone(),
            total_resource_slots: total.map(Self::slots_from_json),
            default_for_unspecified: Self::policy_default_from_str(&default_for_unspecified),
            max_concurrent_sessions: max_concurrent_sessions.map(|v| v as u32),
            max_pending_session_count: max_pending_session_count.map(|v| v as u32),
            max_pending_session_resource_slots: max_pending.map(Self::slots_from_json),
        }))
    }

    async fn upsert_keypair_resource_policy(&self, policy: KeypairResourcePolicy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO keypair_resource_policies
                (access_key, total_resource_slots, default_for_unspecified,
                 max_concurrent_sessions, max_pending_session_count, max_pending_session_resource_slots)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (access_key) DO UPDATE SET
                total_resource_slots = $2,
                default_for_unspecified = $3,
                max_concurrent_sessions = $4,
                max_pending_session_count = $5,
                max_pending_session_resource_slots = $6
            "#,
        )
        .bind(policy.access_key.as_str())
        .bind(policy.total_resource_slots.as_ref().map(Self::slots_to_json))
        .bind(Self::policy_default_str(policy.default_for_unspecified))
        .bind(policy.max_concurrent_sessions.map(|v| v as i32))
        .bind(policy.max_pending_session_count.map(|v| v as i32))
        .bind(
            policy
                .max_pending_session_resource_slots
                .as_ref()
                .map(Self::slots_to_json),
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user_resource_policy(
        &self,
        access_key: &AccessKey,
    ) -> Result<Option<UserResourcePolicy>> {
        let row = sqlx::query(
            "SELECT total_resource_slots, default_for_unspecified FROM user_resource_policies WHERE access_key = $1",
        )
        .bind(access_key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let total: Option<serde_json::Value> = row.try_get("total_resource_slots")?;
        let default_for_unspecified: String = row.try_get("default_for_unspecified")?;
        Ok(Some(UserResourcePolicy {
            access_key: access_key.clone(),
            total_resource_slots: total.map(Self::slots_from_json),
            default_for_unspecified: Self::policy_default_from_str(&default_for_unspecified),
        }))
    }

    async fn upsert_user_resource_policy(&self, policy: UserResourcePolicy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_resource_policies (access_key, total_resource_slots, default_for_unspecified)
            VALUES ($1, $2, $3)
            ON CONFLICT (access_key) DO UPDATE SET
                total_resource_slots = $2,
                default_for_unspecified = $3
            "#,
        )
        .bind(policy.access_key.as_str())
        .bind(policy.total_resource_slots.as_ref().map(Self::slots_to_json))
        .bind(Self::policy_default_str(policy.default_for_unspecified))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_group_resource_policy(
        &self,
        group_name: &str,
    ) -> Result<Option<GroupResourcePolicy>> {
        let row = sqlx::query(
            "SELECT total_resource_slots, default_for_unspecified FROM group_resource_policies WHERE group_name = $1",
        )
        .bind(group_name)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let total: Option<serde_json::Value> = row.try_get("total_resource_slots")?;
        let default_for_unspecified: String = row.try_get("default_for_unspecified")?;
        Ok(Some(GroupResourcePolicy {
            group_name: group_name.to_string(),
            total_resource_slots: total.map(Self::slots_from_json),
            default_for_unspecified: Self::policy_default_from_str(&default_for_unspecified),
        }))
    }

    async fn upsert_group_resource_policy(&self, policy: GroupResourcePolicy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_resource_policies (group_name, total_resource_slots, default_for_unspecified)
            VALUES ($1, $2, $3)
            ON CONFLICT (group_name) DO UPDATE SET
                total_resource_slots = $2,
                default_for_unspecified = $3
            "#,
        )
        .bind(&policy.group_name)
        .bind(policy.total_resource_slots.as_ref().map(Self::slots_to_json))
        .bind(Self::policy_default_str(policy.default_for_unspecified))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_domain_resource_policy(
        &self,
        domain_name: &str,
    ) -> Result<Option<DomainResourcePolicy>> {
        let row = sqlx::query(
            "SELECT total_resource_slots, default_for_unspecified FROM domain_resource_policies WHERE domain_name = $1",
        )
        .bind(domain_name)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let total: Option<serde_json::Value> = row.try_get("total_resource_slots")?;
        let default_for_unspecified: String = row.try_get("default_for_unspecified")?;
        Ok(Some(DomainResourcePolicy {
            domain_name: domain_name.to_string(),
            total_resource_slots: total.map(Self::slots_from_json),
            default_for_unspecified: Self::policy_default_from_str(&default_for_unspecified),
        }))
    }

    async fn upsert_domain_resource_policy(&self, policy: DomainResourcePolicy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO domain_resource_policies (domain_name, total_resource_slots, default_for_unspecified)
            VALUES ($1, $2, $3)
            ON CONFLICT (domain_name) DO UPDATE SET
                total_resource_slots = $2,
                default_for_unspecified = $3
            "#,
        )
        .bind(&policy.domain_name)
        .bind(policy.total_resource_slots.as_ref().map(Self::slots_to_json))
        .bind(Self::policy_default_str(policy.default_for_unspecified))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_kernel(row: &sqlx::postgres::PgRow) -> Result<Kernel> {
    let id: uuid::Uuid = row.try_get("id")?;
    let session_id: uuid::Uuid = row.try_get("session_id")?;
    let agent_id: Option<String> = row.try_get("agent_id")?;
    let status: String = row.try_get("status")?;
    let occupied_slots: serde_json::Value = row.try_get("occupied_slots")?;
    let image: String = row.try_get("image")?;
    let architecture: String = row.try_get("architecture")?;
    let created_at = row.try_get("created_at")?;

    Ok(Kernel {
        id: KernelId::from_string(id.to_string()).map_err(|e| Error::internal(e.to_string()))?,
        session_id: SessionId::from_string(session_id.to_string())
            .map_err(|e| Error::internal(e.to_string()))?,
        agent_id: agent_id
            .map(AgentId::from_string)
            .transpose()
            .map_err(|e| Error::internal(e.to_string()))?,
        status: PostgresRegistry::status_from_str(&status)?,
        occupied_slots: serde_json::from_value(occupied_slots).unwrap_or_default(),
        image,
        architecture,
        created_at,
    })
}

fn row_to_endpoint(row: &sqlx::postgres::PgRow) -> Result<Endpoint> {
    let id: uuid::Uuid = row.try_get("id")?;
    let access_key: String = row.try_get("access_key")?;
    let scaling_group: String = row.try_get("scaling_group")?;
    let lifecycle_stage: String = row.try_get("lifecycle_stage")?;
    let replicas: i32 = row.try_get("replicas")?;
    let retries: i32 = row.try_get("retries")?;

    Ok(Endpoint {
        id: EndpointId::from_string(id.to_string()).map_err(|e| Error::internal(e.to_string()))?,
        access_key: crate::types::AccessKey::from_string(access_key)
            .map_err(|e| Error::internal(e.to_string()))?,
        scaling_group: ScalingGroupName::from_string(scaling_group)
            .map_err(|e| Error::internal(e.to_string()))?,
        lifecycle_stage: PostgresRegistry::endpoint_stage_from_str(&lifecycle_stage)?,
        replicas: replicas as u32,
        retries: retries as u32,
        routes: Vec::new(),
    })
}

fn row_to_route(row: &sqlx::postgres::PgRow) -> Result<Route> {
    let id: uuid::Uuid = row.try_get("id")?;
    let endpoint_id: uuid::Uuid = row.try_get("endpoint_id")?;
    let session_id: Option<uuid::Uuid> = row.try_get("session_id")?;
    let status: String = row.try_get("status")?;
    let created_at = row.try_get("created_at")?;

    Ok(Route {
        id: RouteId::from_string(id.to_string()).map_err(|e| Error::internal(e.to_string()))?,
        endpoint_id: EndpointId::from_string(endpoint_id.to_string())
            .map_err(|e| Error::internal(e.to_string()))?,
        session_id: session_id
            .map(|s| SessionId::from_string(s.to_string()))
            .transpose()
            .map_err(|e| Error::internal(e.to_string()))?,
        status: PostgresRegistry::route_status_from_str(&status)?,
        created_at,
    })
}

fn row_to_agent(row: &sqlx::postgres::PgRow) -> Result<Agent> {
    let id: String = row.try_get("id")?;
    let addr: String = row.try_get("addr")?;
    let scaling_group: String = row.try_get("scaling_group")?;
    let architecture: String = row.try_get("architecture")?;
    let schedulable: bool = row.try_get("schedulable")?;
    let available_slots: serde_json::Value = row.try_get("available_slots")?;
    let occupied_slots: serde_json::Value = row.try_get("occupied_slots")?;
    let container_limit: i32 = row.try_get("container_limit")?;
    let container_count: i32 = row.try_get("container_count")?;
    let last_heartbeat = row.try_get("last_heartbeat")?;

    Ok(Agent {
        id: AgentId::from_string(id).map_err(|e| Error::internal(e.to_string()))?,
        addr,
        scaling_group: ScalingGroupName::from_string(scaling_group)
            .map_err(|e| Error::internal(e.to_string()))?,
        architecture,
        schedulable,
        available_slots: serde_json::from_value(available_slots).unwrap_or_default(),
        occupied_slots: serde_json::from_value(occupied_slots).unwrap_or_default(),
        container_limit: container_limit as u32,
        container_count: container_count as u32,
        last_heartbeat,
    })
}
