use crate::table::{TableName, TableSet};

pub const NOTIFY_FUNCTION: &str = "campus_relay_notify";

/// PostgreSQL rejects `pg_notify` payloads of this many bytes or more.
pub const NOTIFY_PAYLOAD_LIMIT: usize = 8000;

/// PostgreSQL truncates identifiers, channel names included, beyond this.
pub const MAX_CHANNEL_LEN: usize = 63;

pub fn channel_name(prefix: &str, table: TableName) -> String {
    format!("{}_{}", prefix, table.as_str())
}

/// Length of the longest channel `prefix` produces for any known table.
pub fn longest_channel_len(prefix: &str) -> usize {
    TableName::ALL
        .iter()
        .map(|table| channel_name(prefix, *table).len())
        .max()
        .unwrap_or(prefix.len())
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// DDL that makes every table in `tables` emit one `pg_notify` per row change
/// on `<prefix>_<table>`. Safe to apply repeatedly.
///
/// Rows whose payload would exceed [`NOTIFY_PAYLOAD_LIMIT`] are sent with
/// only their `id` and `"truncated": true`. A failing notify raises a
/// warning instead of aborting the application's write.
pub fn notify_trigger_sql(schema: &str, prefix: &str, tables: TableSet) -> String {
    let schema_ident = quote_ident(schema);
    let function = format!("{}.{}", schema_ident, quote_ident(NOTIFY_FUNCTION));
    let mut sql = format!(
        r#"CREATE OR REPLACE FUNCTION {function}() RETURNS trigger
LANGUAGE plpgsql AS $$
DECLARE
    channel text := {prefix} || '_' || TG_TABLE_NAME;
    new_row jsonb := CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE to_jsonb(NEW) END;
    old_row jsonb := CASE WHEN TG_OP = 'INSERT' THEN NULL ELSE to_jsonb(OLD) END;
    stamp text := to_char(clock_timestamp() AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS.US"Z"');
    payload text;
BEGIN
    payload := jsonb_build_object(
        'schema', TG_TABLE_SCHEMA,
        'table', TG_TABLE_NAME,
        'type', TG_OP,
        'record', new_row,
        'old_record', old_row,
        'commit_timestamp', stamp
    )::text;

    IF octet_length(payload) >= {limit} THEN
        RAISE WARNING '{name}: % on %.% is % bytes, sending keys only',
            TG_OP, TG_TABLE_SCHEMA, TG_TABLE_NAME, octet_length(payload);
        payload := jsonb_build_object(
            'schema', TG_TABLE_SCHEMA,
            'table', TG_TABLE_NAME,
            'type', TG_OP,
            'record', CASE WHEN new_row IS NULL THEN NULL ELSE jsonb_build_object('id', new_row -> 'id') END,
            'old_record', CASE WHEN old_row IS NULL THEN NULL ELSE jsonb_build_object('id', old_row -> 'id') END,
            'commit_timestamp', stamp,
            'truncated', true
        )::text;
    END IF;

    BEGIN
        PERFORM pg_notify(channel, payload);
    EXCEPTION WHEN others THEN
        RAISE WARNING '{name}: notify on % failed: %', channel, SQLERRM;
    END;
    RETURN NULL;
END;
$$;
"#,
        prefix = quote_literal(prefix),
        limit = NOTIFY_PAYLOAD_LIMIT,
        name = NOTIFY_FUNCTION,
    );

    for table in tables.iter() {
        let trigger = quote_ident(&format!("{}_{}", NOTIFY_FUNCTION, table.as_str()));
        let target = format!("{}.{}", schema_ident, quote_ident(table.as_str()));
        sql.push_str(&format!(
            "\nDROP TRIGGER IF EXISTS {trigger} ON {target};\n\
             CREATE TRIGGER {trigger}\n    \
             AFTER INSERT OR UPDATE OR DELETE ON {target}\n    \
             FOR EACH ROW EXECUTE FUNCTION {function}();\n"
        ));
    }
    sql
}
