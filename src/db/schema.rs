//! Raw DDL for the task/suite/env store. Tables are created with
//! `CREATE TABLE IF NOT EXISTS` at startup; there is no migration layer.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS benchmark_suite (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at      TEXT NOT NULL,
    author          TEXT NOT NULL,
    description     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runtime_env (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    suite_id                INTEGER NOT NULL UNIQUE REFERENCES benchmark_suite(id),
    dockerfile              TEXT NOT NULL,
    cpu_limit               INTEGER NOT NULL,
    memory_limit            INTEGER NOT NULL,
    cpu_time_limit          INTEGER NOT NULL,
    wall_clock_time_limit   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runtime_param (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    env_id      INTEGER NOT NULL REFERENCES runtime_env(id),
    key         TEXT NOT NULL,
    value       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS benchmark_task (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    suite_id        INTEGER NOT NULL REFERENCES benchmark_suite(id),
    command         TEXT NOT NULL,
    state           INTEGER NOT NULL,
    assigned_at     TEXT,
    updated_at      TEXT,
    assignee        TEXT,
    exitcode        INTEGER,
    build_output    TEXT,
    output          TEXT,
    stats           TEXT,
    result          TEXT
);

CREATE INDEX IF NOT EXISTS idx_benchmark_task_suite ON benchmark_task(suite_id);
CREATE INDEX IF NOT EXISTS idx_benchmark_task_state_id ON benchmark_task(state, id);
CREATE INDEX IF NOT EXISTS idx_runtime_param_env ON runtime_param(env_id);
"#;
