use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::XferoError;

/// Connector parameters for a remote system. The engine never interprets
/// these; they are handed to the transfer step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
    pub partner_id: i64,
    pub service_name: String,
    pub service_description: String,
    pub cots_product: String,
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
    pub credentials_ref: Option<String>,
    pub pgp_key_handle: Option<String>,
    pub retry_count: i64,
    pub retry_wait_secs: i64,
    /// JSON object of product-specific extras
    pub params: String,
}

impl Partner {
    /// A partner with only a service name set; the remaining fields take
    /// their column defaults.
    pub fn named(service_name: &str) -> Self {
        Partner {
            partner_id: 0,
            service_name: service_name.to_owned(),
            service_description: String::new(),
            cots_product: String::new(),
            remote_host: None,
            remote_user: None,
            credentials_ref: None,
            pgp_key_handle: None,
            retry_count: 0,
            retry_wait_secs: 0,
            params: "{}".to_owned(),
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Partner {
            partner_id: row.get(0)?,
            service_name: row.get(1)?,
            service_description: row.get(2)?,
            cots_product: row.get(3)?,
            remote_host: row.get(4)?,
            remote_user: row.get(5)?,
            credentials_ref: row.get(6)?,
            pgp_key_handle: row.get(7)?,
            retry_count: row.get(8)?,
            retry_wait_secs: row.get(9)?,
            params: row.get(10)?,
        })
    }

    /// Inserts `partner` (its `partner_id` is ignored) and returns the stored row
    pub fn create(conn: &Connection, partner: &Partner) -> Result<Self, XferoError> {
        let partner_id: i64 = conn.query_row(
            "INSERT INTO partners (
                service_name, service_description, cots_product, remote_host, remote_user,
                credentials_ref, pgp_key_handle, retry_count, retry_wait_secs, params
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING partner_id",
            rusqlite::params![
                partner.service_name,
                partner.service_description,
                partner.cots_product,
                partner.remote_host,
                partner.remote_user,
                partner.credentials_ref,
                partner.pgp_key_handle,
                partner.retry_count,
                partner.retry_wait_secs,
                partner.params,
            ],
            |row| row.get(0),
        )?;
        Ok(Partner {
            partner_id,
            ..partner.clone()
        })
    }

    pub fn get_by_id(conn: &Connection, partner_id: i64) -> Result<Option<Self>, XferoError> {
        conn.query_row(
            "SELECT partner_id, service_name, service_description, cots_product, remote_host,
                remote_user, credentials_ref, pgp_key_handle, retry_count, retry_wait_secs, params
            FROM partners
            WHERE partner_id = ?",
            [partner_id],
            Partner::from_row,
        )
        .optional()
        .map_err(XferoError::DatabaseError)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, XferoError> {
        let mut stmt = conn.prepare(
            "SELECT partner_id, service_name, service_description, cots_product, remote_host,
                remote_user, credentials_ref, pgp_key_handle, retry_count, retry_wait_secs, params
            FROM partners
            ORDER BY service_name ASC",
        )?;
        let rows = stmt.query_map([], Partner::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update(&self, conn: &Connection) -> Result<(), XferoError> {
        let changed = conn.execute(
            "UPDATE partners SET
                service_name = ?, service_description = ?, cots_product = ?, remote_host = ?,
                remote_user = ?, credentials_ref = ?, pgp_key_handle = ?, retry_count = ?,
                retry_wait_secs = ?, params = ?
            WHERE partner_id = ?",
            rusqlite::params![
                self.service_name,
                self.service_description,
                self.cots_product,
                self.remote_host,
                self.remote_user,
                self.credentials_ref,
                self.pgp_key_handle,
                self.retry_count,
                self.retry_wait_secs,
                self.params,
                self.partner_id,
            ],
        )?;
        if changed == 0 {
            return Err(XferoError::Error(format!("Partner {} not found", self.partner_id)));
        }
        Ok(())
    }

    /// Fails while an xfer still references the partner
    pub fn delete(conn: &Connection, partner_id: i64) -> Result<(), XferoError> {
        conn.execute("DELETE FROM partners WHERE partner_id = ?", [partner_id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::scratch_db;

    #[test]
    fn test_partner_crud() {
        let (_dir, db) = scratch_db();
        let conn = db.get_connection().unwrap();

        let mut partner = Partner::named("BANK_A");
        partner.remote_host = Some("sftp.bank-a.example".into());
        partner.retry_count = 3;
        let mut stored = Partner::create(&conn, &partner).unwrap();
        assert!(stored.partner_id > 0);
        assert_eq!(Partner::get_by_id(&conn, stored.partner_id).unwrap().unwrap(), stored);

        stored.pgp_key_handle = Some("0xDEADBEEF".into());
        stored.update(&conn).unwrap();
        assert_eq!(
            Partner::get_by_id(&conn, stored.partner_id)
                .unwrap()
                .unwrap()
                .pgp_key_handle
                .as_deref(),
            Some("0xDEADBEEF")
        );

        assert!(Partner::create(&conn, &Partner::named("BANK_A")).is_err());
        Partner::delete(&conn, stored.partner_id).unwrap();
        assert!(Partner::list(&conn).unwrap().is_empty());
    }
}
