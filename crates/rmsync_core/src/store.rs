//! Local store access: connection setup, upsert statements, residency writes and the
//! read accessors consumed by list views.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::migrate::migrate_connection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationRow {
    pub id: i64,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub location_type: Option<String>,
    pub dimension: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacterRow {
    pub id: i64,
    pub name: Option<String>,
    pub status: Option<String>,
    pub species: Option<String>,
    pub gender: Option<String>,
    pub origin: String,
    pub location: String,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResidentSummary {
    pub id: i64,
    pub name: Option<String>,
    pub status: Option<String>,
    pub species: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationSummary {
    pub id: i64,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub location_type: Option<String>,
    pub dimension: Option<String>,
    pub residents: Vec<ResidentSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub locations: usize,
    pub characters: usize,
    pub residents: usize,
}

/// Open (creating if needed) the sqlite database with the pragmas ingestion relies on.
pub fn open_connection(db_path: &Path) -> Result<Connection> {
    ensure_db_parent(db_path)?;
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

/// Open the database and bring its schema up to date.
pub fn open_store(db_path: &Path) -> Result<Connection> {
    let connection = open_connection(db_path)?;
    migrate_connection(&connection)?;
    Ok(connection)
}

pub fn upsert_location(connection: &Connection, row: &LocationRow) -> Result<()> {
    connection
        .execute(
            "INSERT INTO locations (id, name, type, dimension)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                type = excluded.type,
                dimension = excluded.dimension",
            params![row.id, row.name, row.location_type, row.dimension],
        )
        .with_context(|| format!("failed to upsert location {}", row.id))?;
    Ok(())
}

pub fn upsert_character(connection: &Connection, row: &CharacterRow) -> Result<()> {
    connection
        .execute(
            "INSERT INTO characters (id, name, status, species, gender, origin, location, image)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                species = excluded.species,
                gender = excluded.gender,
                origin = excluded.origin,
                location = excluded.location,
                image = excluded.image",
            params![
                row.id,
                row.name,
                row.status,
                row.species,
                row.gender,
                row.origin,
                row.location,
                row.image
            ],
        )
        .with_context(|| format!("failed to upsert character {}", row.id))?;
    Ok(())
}

/// Remove every residency row for `location_id`. Returns the number of rows removed.
pub fn clear_location_residents(connection: &Connection, location_id: i64) -> Result<usize> {
    connection
        .execute(
            "DELETE FROM location_residents WHERE location_id = ?1",
            [location_id],
        )
        .with_context(|| format!("failed to clear residents of location {location_id}"))
}

/// Insert a residency pair; an already present pair is left alone.
/// Returns `true` when a new row was written.
pub fn link_resident(connection: &Connection, location_id: i64, character_id: i64) -> Result<bool> {
    let inserted = connection
        .execute(
            "INSERT INTO location_residents (location_id, character_id)
            VALUES (?1, ?2)
            ON CONFLICT(location_id, character_id) DO NOTHING",
            params![location_id, character_id],
        )
        .with_context(|| {
            format!("failed to link character {character_id} to location {location_id}")
        })?;
    Ok(inserted > 0)
}

pub fn resident_ids(connection: &Connection, location_id: i64) -> Result<Vec<i64>> {
    let mut statement = connection
        .prepare(
            "SELECT character_id FROM location_residents
             WHERE location_id = ?1
             ORDER BY character_id",
        )
        .context("failed to prepare resident query")?;
    let rows = statement
        .query_map([location_id], |row| row.get(0))
        .context("failed to run resident query")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode resident row")?);
    }
    Ok(out)
}

/// All locations ordered by id, each with the summaries of its current residents.
/// Residency rows whose character has not been stored are omitted.
pub fn list_locations(connection: &Connection) -> Result<Vec<LocationSummary>> {
    let mut statement = connection
        .prepare(
            "SELECT l.id, l.name, l.type, l.dimension,
                    c.id, c.name, c.status, c.species, c.image
             FROM locations l
             LEFT JOIN location_residents r ON r.location_id = l.id
             LEFT JOIN characters c ON c.id = r.character_id
             ORDER BY l.id, r.character_id",
        )
        .context("failed to prepare location listing query")?;
    let rows = statement
        .query_map([], |row| {
            let location = LocationRow {
                id: row.get(0)?,
                name: row.get(1)?,
                location_type: row.get(2)?,
                dimension: row.get(3)?,
            };
            let resident = match row.get::<_, Option<i64>>(4)? {
                Some(id) => Some(ResidentSummary {
                    id,
                    name: row.get(5)?,
                    status: row.get(6)?,
                    species: row.get(7)?,
                    image: row.get(8)?,
                }),
                None => None,
            };
            Ok((location, resident))
        })
        .context("failed to run location listing query")?;

    let mut out: Vec<LocationSummary> = Vec::new();
    for row in rows {
        let (location, resident) = row.context("failed to decode location listing row")?;
        let is_new = out.last().is_none_or(|last| last.id != location.id);
        if is_new {
            out.push(LocationSummary {
                id: location.id,
                name: location.name,
                location_type: location.location_type,
                dimension: location.dimension,
                residents: Vec::new(),
            });
        }
        if let Some(resident) = resident
            && let Some(current) = out.last_mut()
        {
            current.residents.push(resident);
        }
    }
    Ok(out)
}

pub fn load_character(connection: &Connection, id: i64) -> Result<Option<CharacterRow>> {
    connection
        .query_row(
            "SELECT id, name, status, species, gender, origin, location, image
             FROM characters WHERE id = ?1",
            [id],
            |row| {
                Ok(CharacterRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    status: row.get(2)?,
                    species: row.get(3)?,
                    gender: row.get(4)?,
                    origin: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    location: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    image: row.get(7)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to load character {id}"))
}

pub fn store_stats(connection: &Connection) -> Result<StoreStats> {
    Ok(StoreStats {
        locations: count_rows(connection, "locations")?,
        characters: count_rows(connection, "characters")?,
        residents: count_rows(connection, "location_residents")?,
    })
}

/// SHA-256 over the ordered contents of the synchronized tables.
/// Equal fingerprints mean byte-identical table contents.
pub fn table_fingerprint(connection: &Connection) -> Result<String> {
    const QUERIES: &[(&str, &str)] = &[
        (
            "locations",
            "SELECT id, name, type, dimension FROM locations ORDER BY id",
        ),
        (
            "characters",
            "SELECT id, name, status, species, gender, origin, location, image
             FROM characters ORDER BY id",
        ),
        (
            "location_residents",
            "SELECT location_id, character_id FROM location_residents
             ORDER BY location_id, character_id",
        ),
    ];

    let mut hasher = Sha256::new();
    for (table, sql) in QUERIES {
        hasher.update(table.as_bytes());
        hasher.update(b"\x1e");
        let mut statement = connection
            .prepare(sql)
            .with_context(|| format!("failed to prepare fingerprint query for {table}"))?;
        let column_count = statement.column_count();
        let mut rows = statement
            .query([])
            .with_context(|| format!("failed to run fingerprint query for {table}"))?;
        while let Some(row) = rows
            .next()
            .with_context(|| format!("failed to read {table} row"))?
        {
            for index in 0..column_count {
                let value = row
                    .get_ref(index)
                    .with_context(|| format!("failed to read {table} column {index}"))?;
                hash_value(&mut hasher, value);
                hasher.update(b"\x1f");
            }
            hasher.update(b"\n");
        }
    }

    let digest = hasher.finalize();
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    Ok(output)
}

fn hash_value(hasher: &mut Sha256, value: ValueRef<'_>) {
    match value {
        ValueRef::Null => hasher.update(b"N"),
        ValueRef::Integer(number) => {
            hasher.update(b"I");
            hasher.update(number.to_string().as_bytes());
        }
        ValueRef::Real(number) => {
            hasher.update(b"R");
            hasher.update(number.to_string().as_bytes());
        }
        ValueRef::Text(bytes) => {
            hasher.update(b"T");
            hasher.update(bytes);
        }
        ValueRef::Blob(bytes) => {
            hasher.update(b"B");
            hasher.update(bytes);
        }
    }
}

fn count_rows(connection: &Connection, table: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .with_context(|| format!("failed to count rows in {table}"))?;
    usize::try_from(count).with_context(|| format!("row count for {table} is negative"))
}

fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn location(id: i64, name: &str) -> LocationRow {
        LocationRow {
            id,
            name: Some(name.to_string()),
            location_type: Some("Planet".to_string()),
            dimension: Some("C-137".to_string()),
        }
    }

    fn character(id: i64, name: &str) -> CharacterRow {
        CharacterRow {
            id,
            name: Some(name.to_string()),
            status: Some("Alive".to_string()),
            species: Some("Human".to_string()),
            gender: Some("Male".to_string()),
            origin: "Earth (C-137)".to_string(),
            location: "Citadel of Ricks".to_string(),
            image: Some(format!("https://example.invalid/{id}.jpeg")),
        }
    }

    #[test]
    fn upsert_location_updates_in_place() {
        let temp = tempdir().expect("tempdir");
        let connection = open_store(&temp.path().join("data").join("test.db")).expect("open");

        upsert_location(&connection, &location(1, "Earth")).expect("insert");
        let mut renamed = location(1, "Earth (Replacement Dimension)");
        renamed.dimension = None;
        upsert_location(&connection, &renamed).expect("update");

        let stats = store_stats(&connection).expect("stats");
        assert_eq!(stats.locations, 1);
        let listed = list_locations(&connection).expect("list");
        assert_eq!(
            listed[0].name.as_deref(),
            Some("Earth (Replacement Dimension)")
        );
        assert!(listed[0].dimension.is_none());
    }

    #[test]
    fn upsert_character_last_write_wins() {
        let temp = tempdir().expect("tempdir");
        let connection = open_store(&temp.path().join("test.db")).expect("open");

        upsert_character(&connection, &character(1, "Rick Sanchez")).expect("insert");
        let mut dead = character(1, "Rick Sanchez");
        dead.status = Some("Dead".to_string());
        upsert_character(&connection, &dead).expect("update");

        let loaded = load_character(&connection, 1)
            .expect("load")
            .expect("character exists");
        assert_eq!(loaded, dead);
        assert!(load_character(&connection, 2).expect("load").is_none());
    }

    #[test]
    fn link_resident_ignores_existing_pair() {
        let temp = tempdir().expect("tempdir");
        let connection = open_store(&temp.path().join("test.db")).expect("open");
        upsert_location(&connection, &location(3, "Citadel of Ricks")).expect("location");

        assert!(link_resident(&connection, 3, 1).expect("first link"));
        assert!(!link_resident(&connection, 3, 1).expect("second link"));
        assert_eq!(resident_ids(&connection, 3).expect("ids"), vec![1]);

        assert_eq!(clear_location_residents(&connection, 3).expect("clear"), 1);
        assert!(resident_ids(&connection, 3).expect("ids").is_empty());
    }

    #[test]
    fn list_locations_joins_known_residents() {
        let temp = tempdir().expect("tempdir");
        let connection = open_store(&temp.path().join("test.db")).expect("open");
        upsert_location(&connection, &location(2, "Abadango")).expect("location");
        upsert_location(&connection, &location(1, "Earth")).expect("location");
        upsert_character(&connection, &character(5, "Jerry Smith")).expect("character");
        upsert_character(&connection, &character(4, "Beth Smith")).expect("character");
        link_resident(&connection, 1, 5).expect("link");
        link_resident(&connection, 1, 4).expect("link");
        link_resident(&connection, 1, 99).expect("link unknown character");

        let listed = list_locations(&connection).expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, 1);
        let ids: Vec<i64> = listed[0].residents.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(listed[1].id, 2);
        assert!(listed[1].residents.is_empty());
    }

    #[test]
    fn fingerprint_changes_with_content_only() {
        let temp = tempdir().expect("tempdir");
        let connection = open_store(&temp.path().join("test.db")).expect("open");
        let empty = table_fingerprint(&connection).expect("fingerprint");

        upsert_location(&connection, &location(1, "Earth")).expect("location");
        let one = table_fingerprint(&connection).expect("fingerprint");
        assert_ne!(empty, one);

        upsert_location(&connection, &location(1, "Earth")).expect("same location");
        assert_eq!(one, table_fingerprint(&connection).expect("fingerprint"));
        assert_eq!(one.len(), 64);
    }
}
