use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;

use crate::protocol::{NoteProps, SchemaProps};
use crate::workspace::WorkspaceKey;

const WORKSPACES: &str = "workspaces";
const CONFIG: &str = "config";
const NOTES: &str = "notes";
const NOTE_FNAMES: &str = "note_fnames";
const SCHEMAS: &str = "schemas";

// Per-workspace records live under "<wskey>\0<id>".
fn scope(ws: &WorkspaceKey) -> String { format!("{}\0", ws) }

fn scoped(ws: &WorkspaceKey, id: &str) -> String { format!("{}\0{}", ws, id) }

fn fname_key(ws: &WorkspaceKey, fname: &str) -> String { scoped(ws, &fname.to_lowercase()) }

fn get_json<T: DeserializeOwned>(tree: &sled::Tree, key: &str) -> Result<Option<T>> {
	match tree.get(key.as_bytes())? {
		Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
		None => Ok(None),
	}
}

fn put_json<T: Serialize>(tree: &sled::Tree, key: &str, value: &T) -> Result<()> {
	tree.insert(key.as_bytes(), serde_json::to_vec(value)?)?;
	Ok(())
}

fn scan_json<T: DeserializeOwned>(tree: &sled::Tree, ws: &WorkspaceKey) -> Result<Vec<T>> {
	let mut out = Vec::new();
	for kv in tree.scan_prefix(scope(ws).as_bytes()) {
		let (_, v) = kv?;
		out.push(serde_json::from_slice(&v)?);
	}
	Ok(out)
}

/// Record a workspace root. Returns false if it was already registered.
pub fn register_workspace(db: &sled::Db, ws: &WorkspaceKey, root: &str, now_ms: i64) -> Result<bool> {
	let tree = db.open_tree(WORKSPACES)?;
	if tree.contains_key(ws.as_str().as_bytes())? { return Ok(false); }
	put_json(&tree, ws.as_str(), &serde_json::json!({ "root": root, "created_at": now_ms }))?;
	Ok(true)
}

pub fn is_registered(db: &sled::Db, ws: &WorkspaceKey) -> Result<bool> {
	Ok(db.open_tree(WORKSPACES)?.contains_key(ws.as_str().as_bytes())?)
}

/// Registered workspace roots, as first given.
pub fn list_workspaces(db: &sled::Db) -> Result<Vec<String>> {
	let tree = db.open_tree(WORKSPACES)?;
	let mut roots = Vec::new();
	for kv in tree.iter() {
		let (_, v) = kv?;
		let rec: JsonValue = serde_json::from_slice(&v)?;
		if let Some(root) = rec.get("root").and_then(|r| r.as_str()) { roots.push(root.to_string()); }
	}
	roots.sort();
	Ok(roots)
}

pub fn get_config(db: &sled::Db, ws: &WorkspaceKey) -> Result<Option<JsonValue>> {
	get_json(&db.open_tree(CONFIG)?, ws.as_str())
}

pub fn put_config(db: &sled::Db, ws: &WorkspaceKey, config: &JsonValue) -> Result<()> {
	put_json(&db.open_tree(CONFIG)?, ws.as_str(), config)
}

pub fn get_note(db: &sled::Db, ws: &WorkspaceKey, id: &str) -> Result<Option<NoteProps>> {
	get_json(&db.open_tree(NOTES)?, &scoped(ws, id))
}

/// fname lookups are case-insensitive.
pub fn get_note_by_fname(db: &sled::Db, ws: &WorkspaceKey, fname: &str) -> Result<Option<NoteProps>> {
	let fnames = db.open_tree(NOTE_FNAMES)?;
	match fnames.get(fname_key(ws, fname).as_bytes())? {
		Some(id) => get_note(db, ws, &String::from_utf8_lossy(&id)),
		None => Ok(None),
	}
}

/// Insert or replace a note and keep the fname index in step with it.
pub fn put_note(db: &sled::Db, ws: &WorkspaceKey, note: &NoteProps) -> Result<()> {
	let notes = db.open_tree(NOTES)?;
	let fnames = db.open_tree(NOTE_FNAMES)?;
	if let Some(prev) = get_json::<NoteProps>(&notes, &scoped(ws, &note.id))? {
		if !prev.fname.eq_ignore_ascii_case(&note.fname) {
			fnames.remove(fname_key(ws, &prev.fname).as_bytes())?;
		}
	}
	put_json(&notes, &scoped(ws, &note.id), note)?;
	fnames.insert(fname_key(ws, &note.fname).as_bytes(), note.id.as_bytes())?;
	Ok(())
}

pub fn delete_note(db: &sled::Db, ws: &WorkspaceKey, id: &str) -> Result<Option<NoteProps>> {
	let notes = db.open_tree(NOTES)?;
	let Some(prev) = get_json::<NoteProps>(&notes, &scoped(ws, id))? else { return Ok(None) };
	notes.remove(scoped(ws, id).as_bytes())?;
	db.open_tree(NOTE_FNAMES)?.remove(fname_key(ws, &prev.fname).as_bytes())?;
	Ok(Some(prev))
}

/// All notes of a workspace, ordered by fname.
pub fn list_notes(db: &sled::Db, ws: &WorkspaceKey) -> Result<Vec<NoteProps>> {
	let mut notes: Vec<NoteProps> = scan_json(&db.open_tree(NOTES)?, ws)?;
	notes.sort_by(|a, b| a.fname.cmp(&b.fname));
	Ok(notes)
}

pub fn has_children(db: &sled::Db, ws: &WorkspaceKey, fname: &str) -> Result<bool> {
	let prefix = fname_key(ws, &format!("{}.", fname));
	Ok(db.open_tree(NOTE_FNAMES)?.scan_prefix(prefix.as_bytes()).next().transpose()?.is_some())
}

pub fn get_schema(db: &sled::Db, ws: &WorkspaceKey, id: &str) -> Result<Option<SchemaProps>> {
	get_json(&db.open_tree(SCHEMAS)?, &scoped(ws, id))
}

pub fn put_schema(db: &sled::Db, ws: &WorkspaceKey, schema: &SchemaProps) -> Result<()> {
	put_json(&db.open_tree(SCHEMAS)?, &scoped(ws, &schema.id), schema)
}

pub fn delete_schema(db: &sled::Db, ws: &WorkspaceKey, id: &str) -> Result<Option<SchemaProps>> {
	let schemas = db.open_tree(SCHEMAS)?;
	let prev = get_json::<SchemaProps>(&schemas, &scoped(ws, id))?;
	if prev.is_some() { schemas.remove(scoped(ws, id).as_bytes())?; }
	Ok(prev)
}

pub fn list_schemas(db: &sled::Db, ws: &WorkspaceKey) -> Result<Vec<SchemaProps>> {
	let mut schemas: Vec<SchemaProps> = scan_json(&db.open_tree(SCHEMAS)?, ws)?;
	schemas.sort_by(|a, b| a.id.cmp(&b.id));
	Ok(schemas)
}

pub fn count_notes(db: &sled::Db, ws: &WorkspaceKey) -> Result<u64> {
	Ok(db.open_tree(NOTES)?.scan_prefix(scope(ws).as_bytes()).count() as u64)
}

pub fn count_schemas(db: &sled::Db, ws: &WorkspaceKey) -> Result<u64> {
	Ok(db.open_tree(SCHEMAS)?.scan_prefix(scope(ws).as_bytes()).count() as u64)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::workspace::normalize;

	fn temp_db() -> sled::Db {
		sled::Config::new().temporary(true).open().unwrap()
	}

	fn note(id: &str, fname: &str) -> NoteProps {
		NoteProps { id: id.to_string(), ..NoteProps::new(fname, "") }
	}

	#[test]
	fn test_fname_index_follows_renames() {
		let db = temp_db();
		let ws = normalize("/kb");
		put_note(&db, &ws, &note("n1", "Daily.Journal")).unwrap();
		assert_eq!(get_note_by_fname(&db, &ws, "daily.journal").unwrap().map(|n| n.id), Some("n1".to_string()));
		put_note(&db, &ws, &note("n1", "weekly")).unwrap();
		assert!(get_note_by_fname(&db, &ws, "daily.journal").unwrap().is_none());
		assert!(get_note_by_fname(&db, &ws, "weekly").unwrap().is_some());
		assert_eq!(delete_note(&db, &ws, "n1").unwrap().map(|n| n.fname), Some("weekly".to_string()));
		assert!(get_note_by_fname(&db, &ws, "weekly").unwrap().is_none());
		assert!(delete_note(&db, &ws, "n1").unwrap().is_none());
	}

	#[test]
	fn test_workspaces_do_not_see_each_other() {
		let db = temp_db();
		let a = normalize("/a");
		let ab = normalize("/a/b");
		put_note(&db, &a, &note("1", "x")).unwrap();
		put_note(&db, &ab, &note("2", "y")).unwrap();
		put_note(&db, &ab, &note("3", "z")).unwrap();
		assert_eq!(count_notes(&db, &a).unwrap(), 1);
		assert_eq!(list_notes(&db, &ab).unwrap().iter().map(|n| n.fname.as_str()).collect::<Vec<_>>(), vec!["y", "z"]);
		assert!(get_note(&db, &a, "2").unwrap().is_none());
	}

	#[test]
	fn test_has_children_uses_dotted_prefix() {
		let db = temp_db();
		let ws = normalize("/kb");
		put_note(&db, &ws, &note("1", "proj")).unwrap();
		put_note(&db, &ws, &note("2", "projects")).unwrap();
		assert!(!has_children(&db, &ws, "proj").unwrap());
		put_note(&db, &ws, &note("3", "proj.alpha")).unwrap();
		assert!(has_children(&db, &ws, "proj").unwrap());
	}

	#[test]
	fn test_register_workspace_once() {
		let db = temp_db();
		let ws = normalize("/Work/KB/");
		assert!(!is_registered(&db, &ws).unwrap());
		assert!(register_workspace(&db, &ws, "/Work/KB", 1).unwrap());
		assert!(!register_workspace(&db, &ws, "/work/kb", 2).unwrap());
		assert_eq!(list_workspaces(&db).unwrap(), vec!["/Work/KB".to_string()]);
	}
}
