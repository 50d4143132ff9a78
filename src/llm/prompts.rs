//! Prompts for the document-extraction stages run against an uploaded statement.

use crate::llm::types::TableLocation;
use schemars::schema_for;

pub const USER_INFORMATION_TAG: &str = "user_information";
pub const TABLES_TAG: &str = "tables";
pub const JSON_TABLE_TAG: &str = "json_table";

pub const SYSTEM_PROMPT_STATEMENT_READER: &str = r#"
You are a careful reader of bank statements. You only report what is printed
in the attached document. You never invent names, numbers or rows, and you
always wrap your answer in the XML-style delimiters you are asked for.
"#;

pub fn user_information_prompt() -> String {
    format!(
        r#"
Read the attached bank statement and summarise who it belongs to.

Return a single JSON object between <{tag}> and </{tag}> with these keys:
  "name"           full name of the account holder
  "account_number" account number exactly as printed
  "account_type"   e.g. savings, current, credit card
  "balance_start"  opening balance of the statement period
  "balance_end"    closing balance of the statement period

You may add further keys for other identifying details printed on the
statement (branch, address, statement period). Use "" for any value you
cannot find. If the statement covers several accounts, return a list of
account numbers under "account_number".

Example:
<{tag}>
{{"name": "Jane Doe", "account_number": "12-3456-7890", "account_type": "current", "balance_start": "1,024.50", "balance_end": "980.10"}}
</{tag}>
"#,
        tag = USER_INFORMATION_TAG
    )
}

pub fn table_inventory_prompt() -> String {
    let schema = schema_for!(Vec<TableLocation>);
    let schema_json = serde_json::to_string_pretty(&schema).unwrap_or_default();
    format!(
        r#"
List every table in the attached bank statement. Tables that continue across
a page break are ONE table. Include transaction listings as well as summary
tables (balances, interest, fees, account details).

For each table give:
  "table_number"  1-based position in the document
  "blurb"         a short title that tells this table apart from the others
  "start_phrase"  the first words of the table's first row or header

Answer with a JSON array matching this schema between <{tag}> and </{tag}>:
{schema}
"#,
        tag = TABLES_TAG,
        schema = schema_json
    )
}

/// Extraction instructions for one table; `location` is `None` when the
/// inventory was empty and the whole document is read as a single table.
pub fn table_extraction_prompt(location: Option<&TableLocation>) -> String {
    let target = match location {
        Some(location) => format!(
            "Extract ONLY table #{} (\"{}\"), which starts with: \"{}\".",
            location.table_number, location.blurb, location.start_phrase
        ),
        None => "Extract the main transaction table of the statement.".to_string(),
    };
    format!(
        r#"
{target}

Return the table as JSON between <{tag}> and </{tag}> in the form
{{"table": [["header 1", "header 2", ...], ["row 1 value", ...], ...]}}

Rules:
- The first row is the header row; every other row has the same number of cells.
- Copy values exactly as printed; use "" for empty cells.
- Merge rows that wrap onto several lines into one row.
- If the table has separate columns for money in and money out, merge them into
  one column where money out is negative.
- Name the column holding the transaction value "transaction_amount". If the
  column tracks the running balance instead, name it "balance".
- Name the date column "date" and the payee/counterparty/narrative column "description".
- Do not add totals, page numbers or carried-forward lines as rows.
"#,
        target = target,
        tag = JSON_TABLE_TAG
    )
}
