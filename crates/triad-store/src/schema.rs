//! Inline schema, created on connect with `CREATE TABLE IF NOT EXISTS`.
//!
//! `ob-poc` keeps schema management outside the Rust tree entirely; there
//! is no sqlite equivalent here, so the allocation server owns its own
//! schema and applies it at startup the same way `sqlx::query` (not the
//! `query!` macro) is used throughout `sem_os_postgres::store` — runtime
//! checked, no compile-time database connection required.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS machines (
    id              INTEGER PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    width           INTEGER NOT NULL,
    height          INTEGER NOT NULL,
    tags            TEXT NOT NULL DEFAULT '',
    in_service      INTEGER NOT NULL DEFAULT 1,
    wrap_horizontal INTEGER NOT NULL DEFAULT 0,
    wrap_vertical   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS bmps (
    id      INTEGER PRIMARY KEY,
    machine INTEGER NOT NULL REFERENCES machines(id),
    address TEXT NOT NULL,
    cabinet INTEGER NOT NULL,
    frame   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS boards (
    id              INTEGER PRIMARY KEY,
    machine         INTEGER NOT NULL REFERENCES machines(id),
    triad_x         INTEGER NOT NULL,
    triad_y         INTEGER NOT NULL,
    triad_z         INTEGER NOT NULL,
    cabinet         INTEGER NOT NULL,
    frame           INTEGER NOT NULL,
    board_num       INTEGER NOT NULL,
    ip_address      TEXT NOT NULL,
    bmp             INTEGER NOT NULL REFERENCES bmps(id),
    root_chip_x     INTEGER NOT NULL,
    root_chip_y     INTEGER NOT NULL,
    enabled         INTEGER NOT NULL DEFAULT 1,
    powered         INTEGER NOT NULL DEFAULT 0,
    last_power_on   TEXT,
    last_power_off  TEXT,
    allocated_job   INTEGER,
    UNIQUE (machine, triad_x, triad_y, triad_z)
);
CREATE INDEX IF NOT EXISTS idx_boards_machine ON boards(machine);
CREATE INDEX IF NOT EXISTS idx_boards_bmp ON boards(bmp);
CREATE INDEX IF NOT EXISTS idx_boards_job ON boards(allocated_job);

CREATE TABLE IF NOT EXISTS links (
    board_a      INTEGER NOT NULL REFERENCES boards(id),
    direction_a  TEXT NOT NULL,
    board_b      INTEGER NOT NULL REFERENCES boards(id),
    live         INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (board_a, direction_a)
);

CREATE TABLE IF NOT EXISTS groups (
    id         INTEGER PRIMARY KEY,
    name       TEXT NOT NULL UNIQUE,
    quota_secs INTEGER,
    group_type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id              INTEGER PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    trust_level     INTEGER NOT NULL DEFAULT 0,
    disabled        INTEGER NOT NULL DEFAULT 0,
    locked          INTEGER NOT NULL DEFAULT 0,
    open_id_subject TEXT,
    password_hash   TEXT,
    is_internal     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_groups (
    user_id  INTEGER NOT NULL REFERENCES users(id),
    group_id INTEGER NOT NULL REFERENCES groups(id),
    PRIMARY KEY (user_id, group_id)
);

CREATE TABLE IF NOT EXISTS jobs (
    id                  INTEGER PRIMARY KEY,
    machine             INTEGER NOT NULL REFERENCES machines(id),
    owner               INTEGER NOT NULL REFERENCES users(id),
    grp                 INTEGER NOT NULL REFERENCES groups(id),
    state               TEXT NOT NULL,
    create_ts           TEXT NOT NULL,
    keepalive_interval_secs INTEGER NOT NULL,
    keepalive_ts        TEXT NOT NULL,
    keepalive_host      TEXT,
    width               INTEGER,
    height              INTEGER,
    depth               INTEGER,
    root_board          INTEGER,
    original_request    BLOB,
    death_reason        TEXT,
    death_ts            TEXT,
    num_pending         INTEGER NOT NULL DEFAULT 0,
    allocation_ts       TEXT,
    allocation_size     INTEGER,
    consolidated        INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_jobs_machine_state ON jobs(machine, state);

CREATE TABLE IF NOT EXISTS requests (
    id         INTEGER PRIMARY KEY,
    job        INTEGER NOT NULL REFERENCES jobs(id),
    kind       TEXT NOT NULL,
    n          INTEGER,
    w          INTEGER,
    h          INTEGER,
    max_dead   INTEGER,
    board_locator_kind TEXT,
    board_locator_value TEXT,
    importance REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_requests_job ON requests(job);

CREATE TABLE IF NOT EXISTS pending_changes (
    id          INTEGER PRIMARY KEY,
    job         INTEGER NOT NULL REFERENCES jobs(id),
    board       INTEGER NOT NULL REFERENCES boards(id),
    from_state  TEXT NOT NULL,
    to_state    TEXT NOT NULL,
    power       TEXT NOT NULL,
    fpga_north  INTEGER NOT NULL DEFAULT 0,
    fpga_south  INTEGER NOT NULL DEFAULT 0,
    fpga_east   INTEGER NOT NULL DEFAULT 0,
    fpga_west   INTEGER NOT NULL DEFAULT 0,
    fpga_nw     INTEGER NOT NULL DEFAULT 0,
    fpga_se     INTEGER NOT NULL DEFAULT 0,
    in_progress INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_pending_changes_job ON pending_changes(job);

CREATE TABLE IF NOT EXISTS board_reports (
    id       INTEGER PRIMARY KEY,
    board    INTEGER NOT NULL REFERENCES boards(id),
    job      INTEGER,
    reporter INTEGER NOT NULL REFERENCES users(id),
    issue    TEXT NOT NULL,
    ts       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_board_reports_board ON board_reports(board);

CREATE TABLE IF NOT EXISTS historical_jobs (
    id                      INTEGER PRIMARY KEY,
    machine                 INTEGER NOT NULL,
    owner                   INTEGER NOT NULL,
    grp                     INTEGER NOT NULL,
    create_ts               TEXT NOT NULL,
    death_ts                TEXT,
    death_reason            TEXT,
    allocation_size         INTEGER,
    num_boards              INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS login_attempts (
    id      INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id),
    success INTEGER NOT NULL,
    ts      TEXT NOT NULL
);
"#;
