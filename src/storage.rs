//! SQLite storage for servers, user assignments, contacts and messages.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::credentials::ServerCredentials;
use crate::evolution::{ApiVersion, Contact, Message};

/// Admin-configured Evolution API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredServer {
    pub id: i64,
    pub name: String,
    pub api_url: String,
    pub api_version: Option<String>,
    pub active: bool,
}

/// Stored contact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredContact {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub last_message: Option<String>,
    pub last_message_time: i64,
    pub status: Option<String>,
    pub profile_pic_url: Option<String>,
}

/// Stored message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub contact_id: String,
    pub from_me: bool,
    pub timestamp: i64,
    pub message_type: String,
    pub body: Option<String>,
    pub media_url: Option<String>,
    pub media_mime: Option<String>,
}

impl From<&Contact> for StoredContact {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.id.clone(),
            name: contact.name.clone(),
            phone: contact.phone.clone(),
            last_message: contact.last_message.clone(),
            last_message_time: contact.timestamp.unwrap_or_default(),
            status: contact.status.clone(),
            profile_pic_url: contact.profile_pic_url.clone(),
        }
    }
}

impl StoredMessage {
    /// Row for a normalized message; `media_url` is the resolved URL when known
    pub fn from_message(message: &Message) -> Self {
        let media = message.media.as_ref();
        Self {
            id: message.id.clone(),
            contact_id: message.chat_id.clone(),
            from_me: message.from_me,
            timestamp: message
                .timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            message_type: message.message_type.clone(),
            body: message.text.clone(),
            media_url: media.and_then(|m| m.resolved_url.clone().or_else(|| m.url.clone())),
            media_mime: media.and_then(|m| m.mime_type.clone()),
        }
    }
}

/// Thread-safe CRM store backed by SQLite
pub struct CrmStore {
    conn: Arc<Mutex<Connection>>,
}

impl CrmStore {
    /// Create a new store in the data directory
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("crm.db");

        let conn = Connection::open(&db_path).context("Failed to open CRM database")?;

        // Enable WAL mode for better performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;

        info!("CRM store initialized at {:?}", db_path);

        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("CRM store lock poisoned"))
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Evolution API servers configured by an admin
            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                api_url TEXT NOT NULL,
                api_token TEXT NOT NULL,
                api_version TEXT,
                active INTEGER NOT NULL DEFAULT 1
            );

            -- Which user talks to which server, through which instance
            CREATE TABLE IF NOT EXISTS user_servers (
                user_id TEXT NOT NULL,
                server_id INTEGER NOT NULL,
                instance_id TEXT NOT NULL,
                PRIMARY KEY (user_id, server_id),
                FOREIGN KEY (server_id) REFERENCES servers(id)
            );

            CREATE TABLE IF NOT EXISTS contacts (
                user_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT,
                phone TEXT,
                last_message TEXT,
                last_message_time INTEGER DEFAULT 0,
                status TEXT,
                profile_pic_url TEXT,
                PRIMARY KEY (user_id, id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                from_me INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                message_type TEXT NOT NULL,
                body TEXT,
                media_url TEXT,
                media_mime TEXT,
                PRIMARY KEY (user_id, id)
            );

            CREATE INDEX IF NOT EXISTS idx_user_servers_instance ON user_servers(instance_id);
            CREATE INDEX IF NOT EXISTS idx_messages_contact ON messages(user_id, contact_id);
            CREATE INDEX IF NOT EXISTS idx_contacts_last_message ON contacts(last_message_time DESC);
            "#,
        )?;

        Ok(())
    }

    /// Register a server and return its id
    pub fn add_server(
        &self,
        name: &str,
        api_url: &str,
        api_token: &str,
        api_version: Option<ApiVersion>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO servers (name, api_url, api_token, api_version, active) VALUES (?1, ?2, ?3, ?4, 1)",
            params![
                name,
                api_url.trim_end_matches('/'),
                api_token,
                api_version.map(|v| v.as_str())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_servers(&self) -> Result<Vec<StoredServer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, api_url, api_version, active FROM servers ORDER BY id",
        )?;

        let servers = stmt
            .query_map([], |row| {
                Ok(StoredServer {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    api_url: row.get(2)?,
                    api_version: row.get(3)?,
                    active: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(servers)
    }

    pub fn set_server_active(&self, server_id: i64, active: bool) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE servers SET active = ?1 WHERE id = ?2",
            params![active, server_id],
        )?;
        Ok(changed > 0)
    }

    /// Assign a server instance to a user
    pub fn assign_server(&self, user_id: &str, server_id: i64, instance_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO user_servers (user_id, server_id, instance_id)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id, server_id) DO UPDATE SET instance_id = excluded.instance_id
            "#,
            params![user_id, server_id, instance_id],
        )?;
        Ok(())
    }

    /// Credentials of the user's first active server assignment
    pub fn credentials_for_user(&self, user_id: &str) -> Result<Option<ServerCredentials>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT s.api_url, s.api_token, us.instance_id, s.api_version
                FROM user_servers us
                JOIN servers s ON s.id = us.server_id
                WHERE us.user_id = ?1 AND s.active = 1
                ORDER BY s.id ASC
                LIMIT 1
                "#,
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(api_url, api_token, instance_id, version)| ServerCredentials {
            api_url,
            api_token,
            instance_id,
            api_version: version.and_then(|v| v.parse().ok()),
        }))
    }

    /// Owner of an instance, for routing webhooks
    pub fn user_for_instance(&self, instance_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT user_id FROM user_servers WHERE instance_id = ?1 ORDER BY server_id LIMIT 1",
                params![instance_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user)
    }

    /// Add or update a contact, keeping known values when new ones are missing
    pub fn upsert_contact(&self, user_id: &str, contact: &StoredContact) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO contacts (user_id, id, name, phone, last_message, last_message_time, status, profile_pic_url)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(user_id, id) DO UPDATE SET
                name = COALESCE(
                    CASE WHEN excluded.name IS NOT NULL AND excluded.name IS NOT excluded.phone
                         THEN excluded.name ELSE NULL END,
                    contacts.name
                ),
                phone = COALESCE(excluded.phone, contacts.phone),
                last_message = CASE WHEN excluded.last_message_time >= contacts.last_message_time
                                    THEN COALESCE(excluded.last_message, contacts.last_message)
                                    ELSE contacts.last_message END,
                last_message_time = MAX(contacts.last_message_time, excluded.last_message_time),
                status = COALESCE(excluded.status, contacts.status),
                profile_pic_url = COALESCE(excluded.profile_pic_url, contacts.profile_pic_url)
            "#,
            params![
                user_id,
                contact.id,
                contact.name,
                contact.phone,
                contact.last_message,
                contact.last_message_time,
                contact.status,
                contact.profile_pic_url,
            ],
        )?;

        Ok(())
    }

    /// Get all contacts of a user sorted by last message time
    pub fn get_contacts(&self, user_id: &str) -> Result<Vec<StoredContact>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, name, phone, last_message, last_message_time, status, profile_pic_url
             FROM contacts WHERE user_id = ? ORDER BY last_message_time DESC, id ASC",
        )?;

        let contacts = stmt
            .query_map(params![user_id], contact_from_row)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(contacts)
    }

    /// Get a contact by ID
    pub fn get_contact(&self, user_id: &str, contact_id: &str) -> Result<Option<StoredContact>> {
        let conn = self.conn()?;

        let contact = conn
            .query_row(
                "SELECT id, name, phone, last_message, last_message_time, status, profile_pic_url
                 FROM contacts WHERE user_id = ? AND id = ?",
                params![user_id, contact_id],
                contact_from_row,
            )
            .optional()?;

        Ok(contact)
    }

    /// Overwrite the editable fields of a contact. Returns false if it does not exist.
    pub fn update_contact(
        &self,
        user_id: &str,
        contact_id: &str,
        name: Option<&str>,
        phone: Option<&str>,
        status: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE contacts SET
                name = COALESCE(?3, name),
                phone = COALESCE(?4, phone),
                status = COALESCE(?5, status)
            WHERE user_id = ?1 AND id = ?2
            "#,
            params![user_id, contact_id, name, phone, status],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_contact(&self, user_id: &str, contact_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM contacts WHERE user_id = ? AND id = ?",
            params![user_id, contact_id],
        )?;
        Ok(changed > 0)
    }

    /// Add a message to the store (duplicates by id are ignored)
    pub fn add_message(&self, user_id: &str, msg: &StoredMessage) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT OR IGNORE INTO messages
            (id, user_id, contact_id, from_me, timestamp, message_type, body, media_url, media_mime)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                msg.id,
                user_id,
                msg.contact_id,
                msg.from_me,
                msg.timestamp,
                msg.message_type,
                msg.body,
                msg.media_url,
                msg.media_mime,
            ],
        )?;

        Ok(())
    }

    /// Get messages for a specific contact, oldest first
    pub fn get_messages(&self, user_id: &str, contact_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, contact_id, from_me, timestamp, message_type, body, media_url, media_mime
            FROM messages
            WHERE user_id = ? AND contact_id = ?
            ORDER BY timestamp ASC
            "#,
        )?;

        let messages = stmt
            .query_map(params![user_id, contact_id], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    contact_id: row.get(1)?,
                    from_me: row.get(2)?,
                    timestamp: row.get(3)?,
                    message_type: row.get(4)?,
                    body: row.get(5)?,
                    media_url: row.get(6)?,
                    media_mime: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(messages)
    }
}

fn contact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredContact> {
    Ok(StoredContact {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        last_message: row.get(3)?,
        last_message_time: row.get(4)?,
        status: row.get(5)?,
        profile_pic_url: row.get(6)?,
    })
}

impl Clone for CrmStore {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}
