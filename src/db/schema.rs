use sqlx::PgPool;

/// DDL executed at startup. `audit_logs.item_id` deliberately carries no
/// foreign key: log rows must keep referencing items after they are deleted.
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"DO $$ BEGIN
        CREATE TYPE user_role AS ENUM ('admin', 'manager', 'viewer');
    EXCEPTION WHEN duplicate_object THEN NULL;
    END $$"#,
    r#"DO $$ BEGIN
        CREATE TYPE audit_action AS ENUM ('CREATE', 'UPDATE', 'DELETE');
    EXCEPTION WHEN duplicate_object THEN NULL;
    END $$"#,
    r#"CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        email TEXT NOT NULL UNIQUE,
        username TEXT NOT NULL UNIQUE,
        hashed_password TEXT NOT NULL,
        full_name TEXT,
        role user_role NOT NULL DEFAULT 'viewer',
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE IF NOT EXISTS inventory_items (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name TEXT NOT NULL,
        sku TEXT NOT NULL UNIQUE,
        description TEXT,
        quantity INTEGER NOT NULL DEFAULT 0 CHECK (quantity >= 0),
        unit_price DOUBLE PRECISION NOT NULL DEFAULT 0 CHECK (unit_price >= 0),
        category TEXT,
        location TEXT,
        created_by UUID NOT NULL REFERENCES users(id),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE IF NOT EXISTS audit_logs (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        action audit_action NOT NULL,
        item_id UUID,
        user_id UUID NOT NULL REFERENCES users(id),
        changes TEXT,
        timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_inventory_items_name ON inventory_items (name)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_inventory_items_category ON inventory_items (category)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_audit_logs_item_id ON audit_logs (item_id)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_audit_logs_timestamp ON audit_logs (timestamp)"#,
];

pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
