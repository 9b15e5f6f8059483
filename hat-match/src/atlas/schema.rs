//! Atlas database schema
//!
//! Mask voxels are stored as little-endian u32 linear indices into the
//! mask's own grid; skeletons as seven little-endian f64 per sample
//! (`z y x tz ty tx alpha`).

use sqlx::SqlitePool;

/// Value stored under `atlas_info.format_version`
pub const FORMAT_VERSION: &str = "1";

pub async fn create_atlas_info_table(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS atlas_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_hemilineages_table(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hemilineages (
            name TEXT PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_somas_table(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS somas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hemilineage TEXT NOT NULL REFERENCES hemilineages(name) ON DELETE CASCADE,
            side TEXT NOT NULL CHECK (side IN ('left', 'right')),
            z REAL NOT NULL,
            y REAL NOT NULL,
            x REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_somas_hemilineage ON somas(hemilineage)")
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_masks_table(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS masks (
            hemilineage TEXT NOT NULL REFERENCES hemilineages(name) ON DELETE CASCADE,
            kind TEXT NOT NULL CHECK (kind IN ('tract', 'whole_neuron', 'cbf')),
            dim_z INTEGER NOT NULL,
            dim_y INTEGER NOT NULL,
            dim_x INTEGER NOT NULL,
            spacing_z REAL NOT NULL,
            spacing_y REAL NOT NULL,
            spacing_x REAL NOT NULL,
            origin_z REAL NOT NULL DEFAULT 0,
            origin_y REAL NOT NULL DEFAULT 0,
            origin_x REAL NOT NULL DEFAULT 0,
            voxels BLOB NOT NULL,
            PRIMARY KEY (hemilineage, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_skeletons_table(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS skeletons (
            hemilineage TEXT PRIMARY KEY REFERENCES hemilineages(name) ON DELETE CASCADE,
            samples INTEGER NOT NULL,
            data BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Create every atlas table (idempotent)
pub async fn create_all(pool: &SqlitePool) -> sqlx::Result<()> {
    create_atlas_info_table(pool).await?;
    create_hemilineages_table(pool).await?;
    create_somas_table(pool).await?;
    create_masks_table(pool).await?;
    create_skeletons_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO atlas_info (key, value) VALUES ('format_version', ?)")
        .bind(FORMAT_VERSION)
        .execute(pool)
        .await?;
    Ok(())
}
