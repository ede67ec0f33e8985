table! {
    activity_logs (id) {
        id -> Varchar,
        actor_email -> Varchar,
        action -> Varchar,
        details -> Nullable<Varchar>,
        ip_address -> Nullable<Varchar>,
        created_at -> Timestamp,
    }
}

table! {
    share_records (id) {
        id -> Varchar,
        file_name -> Varchar,
        blob_location -> Varchar,
        mime_type -> Varchar,
        size_bytes -> Int8,
        recipient_email -> Varchar,
        uploader_id -> Varchar,
        iv -> Varchar,
        auth_tag -> Varchar,
        download_token -> Nullable<Varchar>,
        revoked_token -> Nullable<Varchar>,
        token_expires_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
    }
}

table! {
    users (id) {
        id -> Varchar,
        email -> Varchar,
        role -> Varchar,
        created_at -> Timestamp,
    }
}

joinable!(share_records -> users (uploader_id));

allow_tables_to_appear_in_same_query!(activity_logs, share_records, users,);
