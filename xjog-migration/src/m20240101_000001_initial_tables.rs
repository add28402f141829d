use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let sql = r#"
            CREATE TABLE instances (
                timestamp timestamptz NOT NULL DEFAULT (now()),
                instance_id text NOT NULL,
                dying boolean NOT NULL DEFAULT false,
                PRIMARY KEY (instance_id)
            );

            CREATE TABLE charts (
                timestamp timestamptz NOT NULL DEFAULT (now()),
                owner_id text NOT NULL,
                machine_id text NOT NULL,
                chart_id text NOT NULL,
                parent_machine_id text DEFAULT NULL,
                parent_chart_id text DEFAULT NULL,
                state bytea NOT NULL,
                paused boolean NOT NULL DEFAULT false,
                PRIMARY KEY (machine_id, chart_id)
            );

            CREATE TABLE deferred_events (
                id bigserial NOT NULL,
                machine_id text NOT NULL,
                chart_id text NOT NULL,
                event_id text NOT NULL,
                event_to text DEFAULT NULL,
                event text NOT NULL,
                timestamp timestamptz NOT NULL DEFAULT (now()),
                delay bigint NOT NULL,
                due timestamptz NOT NULL,
                lock text DEFAULT NULL,
                PRIMARY KEY (id)
            );

            CREATE INDEX deferred_events_chart_index
                ON deferred_events (machine_id, chart_id);

            CREATE TABLE ongoing_activities (
                machine_id text NOT NULL,
                chart_id text NOT NULL,
                activity_id text NOT NULL,
                PRIMARY KEY (machine_id, chart_id, activity_id)
            );

            CREATE TABLE external_ids (
                key text NOT NULL,
                value text NOT NULL,
                machine_id text NOT NULL,
                chart_id text NOT NULL,
                PRIMARY KEY (key, value)
            );

            CREATE INDEX external_ids_key_index ON external_ids (key);
            CREATE INDEX external_ids_chart_index ON external_ids (machine_id, chart_id);

            CREATE TABLE journal_entries (
                id bigserial NOT NULL,
                timestamp timestamptz NOT NULL DEFAULT (now()),
                machine_id text NOT NULL,
                chart_id text NOT NULL,
                event bytea DEFAULT NULL,
                state bytea DEFAULT NULL,
                context bytea DEFAULT NULL,
                state_delta bytea NOT NULL,
                context_delta bytea NOT NULL,
                PRIMARY KEY (id)
            );

            CREATE INDEX journal_entries_chart_index
                ON journal_entries (machine_id, chart_id);

            CREATE TABLE full_journal_states (
                id bigint NOT NULL,
                created timestamptz NOT NULL DEFAULT (now()),
                timestamp timestamptz NOT NULL DEFAULT (now()),
                owner_id text NOT NULL,
                machine_id text NOT NULL,
                chart_id text NOT NULL,
                parent_machine_id text DEFAULT NULL,
                parent_chart_id text DEFAULT NULL,
                event bytea DEFAULT NULL,
                state bytea DEFAULT NULL,
                context bytea DEFAULT NULL,
                PRIMARY KEY (machine_id, chart_id)
            );

            CREATE TABLE digests (
                created timestamptz NOT NULL DEFAULT (now()),
                timestamp timestamptz NOT NULL DEFAULT (now()),
                machine_id text NOT NULL,
                chart_id text NOT NULL,
                key text NOT NULL,
                value text NOT NULL,
                PRIMARY KEY (machine_id, chart_id, key)
            );
        "#;
        crate::from_sql(manager, sql).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let sql = r#"
            DROP TABLE IF EXISTS digests;
            DROP TABLE IF EXISTS full_journal_states;
            DROP TABLE IF EXISTS journal_entries;
            DROP TABLE IF EXISTS external_ids;
            DROP TABLE IF EXISTS ongoing_activities;
            DROP TABLE IF EXISTS deferred_events;
            DROP TABLE IF EXISTS charts;
            DROP TABLE IF EXISTS instances;
        "#;
        crate::from_sql(manager, sql).await
    }
}
