use std::collections::HashMap;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use zapcrm_contracts::{
    ConnectionConfig, ContactActivity, ContactRecord, DeliveryStatus, GatewayCredentials,
    MessageDirection, MessageRecord,
};
use zapcrm_kernel::{status_predecessors, status_transition_allowed};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("inconsistent store data: {0}")]
    Corrupt(String),
}

/// A message about to be recorded, already normalized by the caller.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub phone: String,
    pub direction: MessageDirection,
    pub content: Option<String>,
    pub media_kind: Option<String>,
    pub media_url: Option<String>,
    pub gateway_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Recorded {
        contact_id: String,
        contact_created: bool,
        message: MessageRecord,
    },
    Duplicate {
        message_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied {
        message_id: String,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
    Unmatched,
    Rejected {
        message_id: String,
        current: Option<DeliveryStatus>,
        target: DeliveryStatus,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum MessageKey<'a> {
    Gateway(&'a str),
    Local(&'a str),
}

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
pub struct MemoryStore {
    contacts: HashMap<String, ContactRecord>,
    contact_by_phone: HashMap<(String, String), String>,
    messages: Vec<MessageRecord>,
    message_by_gateway_id: HashMap<(String, String), usize>,
    configs: HashMap<String, ConnectionConfig>,
}

pub struct SqliteStore {
    conn: Connection,
}

impl StoreBackend {
    /// Dedup check, contact upsert and message insert as one unit.
    pub fn record_message(
        &mut self,
        tenant_id: &str,
        new: NewMessage,
        now: &str,
    ) -> Result<RecordOutcome, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.record_message(tenant_id, new, now)),
            StoreBackend::Sqlite(store) => store.record_message(tenant_id, new, now),
        }
    }

    pub fn reconcile_status(
        &mut self,
        tenant_id: &str,
        gateway_message_id: &str,
        target: DeliveryStatus,
        now: &str,
    ) -> Result<ReconcileOutcome, StoreError> {
        self.transition_status(tenant_id, MessageKey::Gateway(gateway_message_id), target, now)
    }

    pub fn mark_failed(
        &mut self,
        tenant_id: &str,
        message_id: &str,
        now: &str,
    ) -> Result<ReconcileOutcome, StoreError> {
        self.transition_status(
            tenant_id,
            MessageKey::Local(message_id),
            DeliveryStatus::Failed,
            now,
        )
    }

    fn transition_status(
        &mut self,
        tenant_id: &str,
        key: MessageKey<'_>,
        target: DeliveryStatus,
        now: &str,
    ) -> Result<ReconcileOutcome, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.transition_status(tenant_id, key, target, now)),
            StoreBackend::Sqlite(store) => store.transition_status(tenant_id, key, target, now),
        }
    }

    /// Returns false when another record of the tenant already holds the id.
    pub fn attach_gateway_message_id(
        &mut self,
        tenant_id: &str,
        message_id: &str,
        gateway_message_id: &str,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                Ok(store.attach_gateway_message_id(tenant_id, message_id, gateway_message_id))
            }
            StoreBackend::Sqlite(store) => {
                store.attach_gateway_message_id(tenant_id, message_id, gateway_message_id)
            }
        }
    }

    /// Returns false when the tenant has no connection config yet.
    pub fn set_connected(
        &mut self,
        tenant_id: &str,
        connected: bool,
        now: &str,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .configs
                .get_mut(tenant_id)
                .map(|cfg| {
                    cfg.connected = connected;
                    cfg.updated_at = now.to_string();
                })
                .is_some()),
            StoreBackend::Sqlite(store) => store.set_connected(tenant_id, connected, now),
        }
    }

    /// Result of an explicit status poll; a reported phone number is kept.
    pub fn save_polled_status(
        &mut self,
        tenant_id: &str,
        connected: bool,
        phone_number: Option<&str>,
        now: &str,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .configs
                .get_mut(tenant_id)
                .map(|cfg| {
                    cfg.connected = connected;
                    if let Some(phone) = phone_number {
                        cfg.phone_number = Some(phone.to_string());
                    }
                    cfg.updated_at = now.to_string();
                })
                .is_some()),
            StoreBackend::Sqlite(store) => {
                let changed = store.conn.execute(
                    "
                    UPDATE gateway_configs SET
                        connected = ?1,
                        phone_number = COALESCE(?2, phone_number),
                        updated_at = ?3
                    WHERE tenant_id = ?4
                    ",
                    params![connected, phone_number, now, tenant_id],
                )?;
                Ok(changed > 0)
            }
        }
    }

    pub fn upsert_gateway_config(
        &mut self,
        tenant_id: &str,
        credentials: GatewayCredentials,
        now: &str,
    ) -> Result<ConnectionConfig, StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let cfg = store
                    .configs
                    .entry(tenant_id.to_string())
                    .and_modify(|cfg| {
                        cfg.credentials = credentials.clone();
                        cfg.updated_at = now.to_string();
                    })
                    .or_insert_with(|| ConnectionConfig {
                        tenant_id: tenant_id.to_string(),
                        credentials: credentials.clone(),
                        connected: false,
                        phone_number: None,
                        qr_code: None,
                        qr_code_updated_at: None,
                        updated_at: now.to_string(),
                    });
                Ok(cfg.clone())
            }
            StoreBackend::Sqlite(store) => store.upsert_gateway_config(tenant_id, &credentials, now),
        }
    }

    pub fn gateway_config(&self, tenant_id: &str) -> Result<Option<ConnectionConfig>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.configs.get(tenant_id).cloned()),
            StoreBackend::Sqlite(store) => store.gateway_config(tenant_id),
        }
    }

    pub fn save_qr_code(
        &mut self,
        tenant_id: &str,
        image: &str,
        now: &str,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .configs
                .get_mut(tenant_id)
                .map(|cfg| {
                    cfg.qr_code = Some(image.to_string());
                    cfg.qr_code_updated_at = Some(now.to_string());
                })
                .is_some()),
            StoreBackend::Sqlite(store) => store.save_qr_code(tenant_id, image, now),
        }
    }

    pub fn contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<ContactRecord>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .contacts
                .get(contact_id)
                .filter(|c| c.tenant_id == tenant_id)
                .cloned()),
            StoreBackend::Sqlite(store) => store.contact(tenant_id, contact_id),
        }
    }

    pub fn list_contacts(&self, tenant_id: &str) -> Result<Vec<ContactRecord>, StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let mut contacts: Vec<ContactRecord> = store
                    .contacts
                    .values()
                    .filter(|c| c.tenant_id == tenant_id)
                    .cloned()
                    .collect();
                contacts.sort_by(|a, b| {
                    b.last_activity_at
                        .cmp(&a.last_activity_at)
                        .then_with(|| b.created_at.cmp(&a.created_at))
                });
                Ok(contacts)
            }
            StoreBackend::Sqlite(store) => store.list_contacts(tenant_id),
        }
    }

    pub fn mark_contact_read(
        &mut self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .contacts
                .get_mut(contact_id)
                .filter(|c| c.tenant_id == tenant_id)
                .map(|c| c.unread_count = 0)
                .is_some()),
            StoreBackend::Sqlite(store) => store.mark_contact_read(tenant_id, contact_id),
        }
    }

    pub fn message(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .messages
                .iter()
                .find(|m| m.tenant_id == tenant_id && m.id == message_id)
                .cloned()),
            StoreBackend::Sqlite(store) => store.message(tenant_id, message_id),
        }
    }

    pub fn list_messages(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .messages
                .iter()
                .filter(|m| m.tenant_id == tenant_id && m.contact_id == contact_id)
                .cloned()
                .collect()),
            StoreBackend::Sqlite(store) => store.list_messages(tenant_id, contact_id),
        }
    }
}

impl MemoryStore {
    fn record_message(&mut self, tenant_id: &str, new: NewMessage, now: &str) -> RecordOutcome {
        if let Some(gid) = new.gateway_message_id.as_ref() {
            if let Some(idx) = self
                .message_by_gateway_id
                .get(&(tenant_id.to_string(), gid.clone()))
            {
                return RecordOutcome::Duplicate {
                    message_id: self.messages[*idx].id.clone(),
                };
            }
        }

        let (contact_id, contact_created) =
            self.touch_contact(tenant_id, &new.phone, activity_for(new.direction), now);
        let message = build_message(tenant_id, &contact_id, new, now);
        if let Some(gid) = message.gateway_message_id.as_ref() {
            self.message_by_gateway_id
                .insert((tenant_id.to_string(), gid.clone()), self.messages.len());
        }
        self.messages.push(message.clone());
        RecordOutcome::Recorded {
            contact_id,
            contact_created,
            message,
        }
    }

    fn touch_contact(
        &mut self,
        tenant_id: &str,
        phone: &str,
        activity: ContactActivity,
        now: &str,
    ) -> (String, bool) {
        let key = (tenant_id.to_string(), phone.to_string());
        if let Some(contact) = self
            .contact_by_phone
            .get(&key)
            .and_then(|id| self.contacts.get_mut(id))
        {
            contact.last_activity_at = now.to_string();
            if activity == ContactActivity::Inbound {
                contact.unread_count = contact.unread_count.saturating_add(1);
            }
            return (contact.id.clone(), false);
        }

        let contact = ContactRecord {
            id: new_record_id(),
            tenant_id: tenant_id.to_string(),
            phone: phone.to_string(),
            name: phone.to_string(),
            last_activity_at: now.to_string(),
            unread_count: initial_unread(activity),
            created_at: now.to_string(),
        };
        let id = contact.id.clone();
        self.contact_by_phone.insert(key, id.clone());
        self.contacts.insert(id.clone(), contact);
        (id, true)
    }

    fn transition_status(
        &mut self,
        tenant_id: &str,
        key: MessageKey<'_>,
        target: DeliveryStatus,
        now: &str,
    ) -> ReconcileOutcome {
        let idx = match key {
            MessageKey::Gateway(gid) => self
                .message_by_gateway_id
                .get(&(tenant_id.to_string(), gid.to_string()))
                .copied(),
            MessageKey::Local(id) => self
                .messages
                .iter()
                .position(|m| m.tenant_id == tenant_id && m.id == id),
        };
        match idx {
            Some(idx) => apply_transition(&mut self.messages[idx], target, now),
            None => ReconcileOutcome::Unmatched,
        }
    }

    fn attach_gateway_message_id(
        &mut self,
        tenant_id: &str,
        message_id: &str,
        gateway_message_id: &str,
    ) -> bool {
        let key = (tenant_id.to_string(), gateway_message_id.to_string());
        if self.message_by_gateway_id.contains_key(&key) {
            return false;
        }
        let Some(idx) = self.messages.iter().position(|m| {
            m.tenant_id == tenant_id && m.id == message_id && m.gateway_message_id.is_none()
        }) else {
            return false;
        };
        self.messages[idx].gateway_message_id = Some(gateway_message_id.to_string());
        self.message_by_gateway_id.insert(key, idx);
        true
    }
}

const MESSAGE_COLUMNS: &str = "id, tenant_id, contact_id, direction, content, media_kind, \
     media_url, gateway_message_id, status, delivered_at, read_at, created_at";

const CONTACT_COLUMNS: &str =
    "id, tenant_id, phone, name, last_activity_at, unread_count, created_at";

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                name TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                unread_count INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
                created_at TEXT NOT NULL,
                UNIQUE (tenant_id, phone)
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                contact_id TEXT NOT NULL REFERENCES contacts(id),
                direction TEXT NOT NULL CHECK (direction IN ('in', 'out')),
                content TEXT,
                media_kind TEXT,
                media_url TEXT,
                gateway_message_id TEXT,
                status TEXT CHECK (status IN ('sent', 'delivered', 'read', 'failed')),
                delivered_at TEXT,
                read_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS messages_tenant_gateway_id
                ON messages (tenant_id, gateway_message_id)
                WHERE gateway_message_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS messages_contact
                ON messages (tenant_id, contact_id, created_at);
            CREATE TABLE IF NOT EXISTS gateway_configs (
                tenant_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                token TEXT NOT NULL,
                client_token TEXT NOT NULL,
                connected INTEGER NOT NULL DEFAULT 0,
                phone_number TEXT,
                qr_code TEXT,
                qr_code_updated_at TEXT,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }

    fn record_message(
        &mut self,
        tenant_id: &str,
        new: NewMessage,
        now: &str,
    ) -> Result<RecordOutcome, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(gid) = new.gateway_message_id.as_deref() {
            if let Some(message_id) = find_message_id_by_gateway_id(&tx, tenant_id, gid)? {
                return Ok(RecordOutcome::Duplicate { message_id });
            }
        }

        let (contact_id, contact_created) =
            touch_contact(&tx, tenant_id, &new.phone, activity_for(new.direction), now)?;
        let message = build_message(tenant_id, &contact_id, new, now);

        if let Err(err) = insert_message(&tx, &message) {
            if !is_constraint_violation(&err) {
                return Err(err.into());
            }
            // Lost a race on the gateway id; the transaction is dropped so the
            // contact bump above rolls back with it.
            let existing = match message.gateway_message_id.as_deref() {
                Some(gid) => find_message_id_by_gateway_id(&tx, tenant_id, gid)?,
                None => None,
            };
            return match existing {
                Some(message_id) => Ok(RecordOutcome::Duplicate { message_id }),
                None => Err(err.into()),
            };
        }

        tx.commit()?;
        Ok(RecordOutcome::Recorded {
            contact_id,
            contact_created,
            message,
        })
    }

    fn transition_status(
        &mut self,
        tenant_id: &str,
        key: MessageKey<'_>,
        target: DeliveryStatus,
        now: &str,
    ) -> Result<ReconcileOutcome, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (sql, key_value) = match key {
            MessageKey::Gateway(gid) => (
                "SELECT id, status FROM messages WHERE tenant_id = ?1 AND gateway_message_id = ?2",
                gid,
            ),
            MessageKey::Local(id) => (
                "SELECT id, status FROM messages WHERE tenant_id = ?1 AND id = ?2",
                id,
            ),
        };
        let row: Option<(String, Option<String>)> = tx
            .query_row(sql, params![tenant_id, key_value], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        let Some((message_id, current)) = row else {
            return Ok(ReconcileOutcome::Unmatched);
        };
        let current = current.as_deref().map(parse_status).transpose()?;

        let outcome = match current {
            Some(from) if status_transition_allowed(from, target) => {
                let changed = tx.execute(
                    &compare_and_set_sql(target),
                    params![target.as_str(), now, message_id],
                )?;
                if changed == 1 {
                    ReconcileOutcome::Applied {
                        message_id,
                        from,
                        to: target,
                    }
                } else {
                    ReconcileOutcome::Rejected {
                        message_id,
                        current: Some(from),
                        target,
                    }
                }
            }
            _ => ReconcileOutcome::Rejected {
                message_id,
                current,
                target,
            },
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn attach_gateway_message_id(
        &mut self,
        tenant_id: &str,
        message_id: &str,
        gateway_message_id: &str,
    ) -> Result<bool, StoreError> {
        match self.conn.execute(
            "
            UPDATE messages SET gateway_message_id = ?1
            WHERE tenant_id = ?2 AND id = ?3 AND gateway_message_id IS NULL
            ",
            params![gateway_message_id, tenant_id, message_id],
        ) {
            Ok(changed) => Ok(changed == 1),
            Err(err) if is_constraint_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn set_connected(
        &mut self,
        tenant_id: &str,
        connected: bool,
        now: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE gateway_configs SET connected = ?1, updated_at = ?2 WHERE tenant_id = ?3",
            params![connected, now, tenant_id],
        )?;
        Ok(changed > 0)
    }

    fn upsert_gateway_config(
        &mut self,
        tenant_id: &str,
        credentials: &GatewayCredentials,
        now: &str,
    ) -> Result<ConnectionConfig, StoreError> {
        self.conn.execute(
            "
            INSERT INTO gateway_configs (tenant_id, instance_id, token, client_token, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(tenant_id) DO UPDATE SET
                instance_id=excluded.instance_id,
                token=excluded.token,
                client_token=excluded.client_token,
                updated_at=excluded.updated_at
            ",
            params![
                tenant_id,
                credentials.instance_id,
                credentials.token,
                credentials.client_token,
                now
            ],
        )?;
        self.gateway_config(tenant_id)?
            .ok_or_else(|| StoreError::Corrupt(format!("gateway config for {tenant_id} vanished")))
    }

    fn gateway_config(&self, tenant_id: &str) -> Result<Option<ConnectionConfig>, StoreError> {
        let cfg = self
            .conn
            .query_row(
                "
                SELECT tenant_id, instance_id, token, client_token, connected, phone_number,
                       qr_code, qr_code_updated_at, updated_at
                FROM gateway_configs WHERE tenant_id = ?1
                ",
                params![tenant_id],
                |row| {
                    Ok(ConnectionConfig {
                        tenant_id: row.get(0)?,
                        credentials: GatewayCredentials {
                            instance_id: row.get(1)?,
                            token: row.get(2)?,
                            client_token: row.get(3)?,
                        },
                        connected: row.get(4)?,
                        phone_number: row.get(5)?,
                        qr_code: row.get(6)?,
                        qr_code_updated_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(cfg)
    }

    fn save_qr_code(&mut self, tenant_id: &str, image: &str, now: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE gateway_configs SET qr_code = ?1, qr_code_updated_at = ?2 WHERE tenant_id = ?3",
            params![image, now, tenant_id],
        )?;
        Ok(changed > 0)
    }

    fn contact(&self, tenant_id: &str, contact_id: &str) -> Result<Option<ContactRecord>, StoreError> {
        let contact = self
            .conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id, contact_id],
                contact_from_row,
            )
            .optional()?;
        Ok(contact)
    }

    fn list_contacts(&self, tenant_id: &str) -> Result<Vec<ContactRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE tenant_id = ?1
             ORDER BY last_activity_at DESC, created_at DESC"
        ))?;
        let rows = stmt.query_map(params![tenant_id], contact_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_contact_read(&mut self, tenant_id: &str, contact_id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE contacts SET unread_count = 0 WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, contact_id],
        )?;
        Ok(changed > 0)
    }

    fn message(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, StoreError> {
        let message = self
            .conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id, message_id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    fn list_messages(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE tenant_id = ?1 AND contact_id = ?2
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![tenant_id, contact_id], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn touch_contact(
    conn: &Connection,
    tenant_id: &str,
    phone: &str,
    activity: ContactActivity,
    now: &str,
) -> Result<(String, bool), StoreError> {
    if let Some(id) = find_contact_id(conn, tenant_id, phone)? {
        bump_contact(conn, &id, activity, now)?;
        return Ok((id, false));
    }
    create_contact(conn, tenant_id, phone, activity, now)
}

/// Inserts a contact; if a concurrent writer won the (tenant, phone) slot,
/// the existing row is used and bumped instead.
fn create_contact(
    conn: &Connection,
    tenant_id: &str,
    phone: &str,
    activity: ContactActivity,
    now: &str,
) -> Result<(String, bool), StoreError> {
    let id = new_record_id();
    match conn.execute(
        "
        INSERT INTO contacts (id, tenant_id, phone, name, last_activity_at, unread_count, created_at)
        VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?4)
        ",
        params![id, tenant_id, phone, now, initial_unread(activity)],
    ) {
        Ok(_) => Ok((id, true)),
        Err(err) if is_constraint_violation(&err) => {
            let existing = find_contact_id(conn, tenant_id, phone)?.ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "contact insert for {phone} conflicted but no row exists"
                ))
            })?;
            bump_contact(conn, &existing, activity, now)?;
            Ok((existing, false))
        }
        Err(err) => Err(err.into()),
    }
}

fn find_contact_id(
    conn: &Connection,
    tenant_id: &str,
    phone: &str,
) -> Result<Option<String>, StoreError> {
    let id = conn
        .query_row(
            "SELECT id FROM contacts WHERE tenant_id = ?1 AND phone = ?2",
            params![tenant_id, phone],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn bump_contact(
    conn: &Connection,
    contact_id: &str,
    activity: ContactActivity,
    now: &str,
) -> Result<(), StoreError> {
    let sql = match activity {
        ContactActivity::Inbound => {
            "UPDATE contacts SET last_activity_at = ?1, unread_count = unread_count + 1 WHERE id = ?2"
        }
        ContactActivity::Outbound => "UPDATE contacts SET last_activity_at = ?1 WHERE id = ?2",
    };
    conn.execute(sql, params![now, contact_id])?;
    Ok(())
}

fn find_message_id_by_gateway_id(
    conn: &Connection,
    tenant_id: &str,
    gateway_message_id: &str,
) -> Result<Option<String>, StoreError> {
    let id = conn
        .query_row(
            "SELECT id FROM messages WHERE tenant_id = ?1 AND gateway_message_id = ?2",
            params![tenant_id, gateway_message_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn insert_message(conn: &Connection, m: &MessageRecord) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            m.id,
            m.tenant_id,
            m.contact_id,
            m.direction.as_str(),
            m.content,
            m.media_kind,
            m.media_url,
            m.gateway_message_id,
            m.status.map(|s| s.as_str()),
            m.delivered_at,
            m.read_at,
            m.created_at
        ],
    )?;
    Ok(())
}

fn compare_and_set_sql(target: DeliveryStatus) -> String {
    let allowed = status_predecessors(target)
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "
        UPDATE messages SET
            status = ?1,
            delivered_at = CASE WHEN ?1 = 'delivered' THEN ?2 ELSE delivered_at END,
            read_at = CASE WHEN ?1 = 'read' THEN ?2 ELSE read_at END
        WHERE id = ?3 AND status IN ({allowed})
        "
    )
}

fn contact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRecord> {
    Ok(ContactRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        phone: row.get(2)?,
        name: row.get(3)?,
        last_activity_at: row.get(4)?,
        unread_count: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let direction: String = row.get(3)?;
    let status: Option<String> = row.get(8)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        contact_id: row.get(2)?,
        direction: MessageDirection::parse(&direction).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(3, "direction".to_string(), Type::Text)
        })?,
        content: row.get(4)?,
        media_kind: row.get(5)?,
        media_url: row.get(6)?,
        gateway_message_id: row.get(7)?,
        status: match status.as_deref() {
            Some(s) => Some(DeliveryStatus::parse(s).ok_or_else(|| {
                rusqlite::Error::InvalidColumnType(8, "status".to_string(), Type::Text)
            })?),
            None => None,
        },
        delivered_at: row.get(9)?,
        read_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn parse_status(value: &str) -> Result<DeliveryStatus, StoreError> {
    DeliveryStatus::parse(value)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown message status {value}")))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn apply_transition(
    message: &mut MessageRecord,
    target: DeliveryStatus,
    now: &str,
) -> ReconcileOutcome {
    match message.status {
        Some(from) if status_transition_allowed(from, target) => {
            message.status = Some(target);
            match target {
                DeliveryStatus::Delivered => message.delivered_at = Some(now.to_string()),
                DeliveryStatus::Read => message.read_at = Some(now.to_string()),
                DeliveryStatus::Sent | DeliveryStatus::Failed => {}
            }
            ReconcileOutcome::Applied {
                message_id: message.id.clone(),
                from,
                to: target,
            }
        }
        current => ReconcileOutcome::Rejected {
            message_id: message.id.clone(),
            current,
            target,
        },
    }
}

fn build_message(tenant_id: &str, contact_id: &str, new: NewMessage, now: &str) -> MessageRecord {
    MessageRecord {
        id: new_record_id(),
        tenant_id: tenant_id.to_string(),
        contact_id: contact_id.to_string(),
        direction: new.direction,
        content: new.content,
        media_kind: new.media_kind,
        media_url: new.media_url,
        gateway_message_id: new.gateway_message_id,
        status: match new.direction {
            MessageDirection::Out => Some(DeliveryStatus::Sent),
            MessageDirection::In => None,
        },
        delivered_at: None,
        read_at: None,
        created_at: now.to_string(),
    }
}

fn activity_for(direction: MessageDirection) -> ContactActivity {
    match direction {
        MessageDirection::In => ContactActivity::Inbound,
        MessageDirection::Out => ContactActivity::Outbound,
    }
}

fn initial_unread(activity: ContactActivity) -> u32 {
    match activity {
        ContactActivity::Inbound => 1,
        ContactActivity::Outbound => 0,
    }
}

fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
