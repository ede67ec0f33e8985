use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::result::Error;

use crate::models;

pub fn get_user_from_email(
    email_to_query: &str,
    conn: &PgConnection,
) -> Result<Option<models::User>, Error> {
    use crate::schema::users::dsl::*;
    match users
        .filter(email.eq(email_to_query))
        .first::<models::User>(conn)
    {
        Ok(user) => Ok(Some(user)),
        Err(Error::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn insert_share_record(record: &models::ShareRecord, conn: &PgConnection) -> Result<(), Error> {
    use crate::schema::share_records::dsl::*;
    diesel::insert_into(share_records)
        .values(record)
        .execute(conn)?;
    Ok(())
}

pub fn get_share_record(
    share_id: &str,
    conn: &PgConnection,
) -> Result<Option<models::ShareRecord>, Error> {
    use crate::schema::share_records::dsl::*;
    share_records
        .filter(id.eq(share_id))
        .first::<models::ShareRecord>(conn)
        .optional()
}

/// Matches live tokens and tokens that were revoked, so a revoked link
/// can be reported as such instead of as unknown.
pub fn get_share_record_by_token(
    token: &str,
    conn: &PgConnection,
) -> Result<Option<models::ShareRecord>, Error> {
    use crate::schema::share_records::dsl::*;
    share_records
        .filter(download_token.eq(token).or(revoked_token.eq(token)))
        .first::<models::ShareRecord>(conn)
        .optional()
}

pub fn revoke_share_record(share_id: &str, conn: &PgConnection) -> Result<usize, Error> {
    use crate::schema::share_records::dsl::*;
    diesel::update(
        share_records
            .filter(id.eq(share_id))
            .filter(download_token.is_not_null()),
    )
    .set((
        revoked_token.eq(download_token),
        download_token.eq(None::<String>),
        token_expires_at.eq(None::<NaiveDateTime>),
    ))
    .execute(conn)
}

pub fn get_share_records_for_uploader(
    user_id: &str,
    conn: &PgConnection,
) -> Result<Vec<models::ShareRecord>, Error> {
    use crate::schema::share_records::dsl::*;
    share_records
        .filter(uploader_id.eq(user_id))
        .order(created_at.desc())
        .get_results(conn)
}

/// Each share comes back with the email of the user who sent it.
pub fn get_share_records_for_recipient(
    recipient: &str,
    conn: &PgConnection,
) -> Result<Vec<(models::ShareRecord, String)>, Error> {
    use crate::schema::{share_records, users};
    share_records::table
        .inner_join(users::table)
        .filter(share_records::recipient_email.eq(recipient))
        .select((share_records::all_columns, users::email))
        .order(share_records::created_at.desc())
        .get_results(conn)
}

/// Deletes the user and every share they uploaded in one transaction.
/// Returns the deleted shares so their blobs can be reclaimed, or `None`
/// when no such user exists.
pub fn delete_user_with_shares(
    user_id: &str,
    conn: &PgConnection,
) -> Result<Option<Vec<models::ShareRecord>>, Error> {
    use crate::schema::{share_records, users};
    conn.transaction::<_, Error, _>(|| {
        let owned = share_records::table
            .filter(share_records::uploader_id.eq(user_id))
            .get_results::<models::ShareRecord>(conn)?;
        diesel::delete(share_records::table.filter(share_records::uploader_id.eq(user_id)))
            .execute(conn)?;

        let deleted = diesel::delete(users::table.filter(users::id.eq(user_id))).execute(conn)?;
        if deleted == 0 {
            return Ok(None);
        }
        Ok(Some(owned))
    })
}

pub fn insert_activity_log(entry: &models::ActivityLog, conn: &PgConnection) -> Result<(), Error> {
    use crate::schema::activity_logs::dsl::*;
    diesel::insert_into(activity_logs)
        .values(entry)
        .execute(conn)?;
    Ok(())
}

pub fn get_recent_activity(
    limit: i64,
    conn: &PgConnection,
) -> Result<Vec<models::ActivityLog>, Error> {
    use crate::schema::activity_logs::dsl::*;
    activity_logs
        .order(created_at.desc())
        .limit(limit)
        .get_results(conn)
}
