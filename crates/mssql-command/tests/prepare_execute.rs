//! Prepare/execute lifecycle against the scripted wire doubles.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::*;
use mssql_command::{
    CommandKind, Error, ParamDirection, ParameterCollection, PrepareState, SqlParameter,
    TokenEvent,
};
use tds_rpc::{SqlValue, TdsType};

#[tokio::test]
async fn prepare_then_execute_reuses_handle() {
    let conn = MockConnection::new("s1");
    let mut cmd = text_command(&conn, "SELECT @x");
    cmd.parameters_mut().add(int_param("x", 5));
    cmd.prepare().unwrap();

    conn.parser.push_script(prepexec_scalar_script(17, 5));
    conn.parser.push_script(scalar_script(5));
    conn.parser.push_script(scalar_script(5));

    for _ in 0..3 {
        let value = cmd.execute_scalar().await.unwrap();
        assert_eq!(value, Some(SqlValue::Int(5)));
    }

    let writes = conn.parser.writes();
    assert_eq!(writes.len(), 3);
    // One prepare-execute requesting a fresh handle, then two plain
    // executes on the captured handle.
    assert_eq!(writes[0].proc_name(), "sp_prepexec");
    assert_eq!(writes[0].system_value(0), Some(&SqlValue::Int(-1)));
    assert_eq!(writes[1].proc_name(), "sp_execute");
    assert_eq!(writes[1].system_value(0), Some(&SqlValue::Int(17)));
    assert_eq!(writes[2].proc_name(), "sp_execute");

    assert_eq!(cmd.prepare_state().handle(), Some(17));
    assert!(conn.balanced());
}

#[tokio::test]
async fn dirty_command_reprepares_with_prior_handle() {
    let conn = MockConnection::new("s2");
    let mut cmd = text_command(&conn, "SELECT @x");
    cmd.parameters_mut().add(int_param("x", 5));
    cmd.prepare().unwrap();

    conn.parser.push_script(prepexec_scalar_script(17, 5));
    cmd.execute_scalar().await.unwrap();
    assert!(cmd.prepare_state().is_prepared());

    // Widening the parameter dirties the shape; the close count has not
    // advanced, so the next prepare-execute reuses the server handle.
    cmd.parameters_mut().get_mut(0).unwrap().set_size(8);

    conn.parser.push_script(prepexec_scalar_script(17, 5));
    cmd.execute_scalar().await.unwrap();

    let writes = conn.parser.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].proc_name(), "sp_prepexec");
    assert_eq!(writes[1].system_value(0), Some(&SqlValue::Int(17)));
}

#[tokio::test]
async fn handle_is_not_reused_after_connection_close() {
    let conn = MockConnection::new("close-gen");
    let mut cmd = text_command(&conn, "SELECT @x");
    cmd.parameters_mut().add(int_param("x", 5));
    cmd.prepare().unwrap();

    conn.parser.push_script(prepexec_scalar_script(21, 5));
    cmd.execute_scalar().await.unwrap();

    conn.close_count
        .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    cmd.parameters_mut().get_mut(0).unwrap().set_size(8);

    conn.parser.push_script(prepexec_scalar_script(22, 5));
    cmd.execute_scalar().await.unwrap();

    let writes = conn.parser.writes();
    assert_eq!(writes[1].proc_name(), "sp_prepexec");
    assert_eq!(writes[1].system_value(0), Some(&SqlValue::Int(-1)));
}

#[tokio::test]
async fn prepare_is_idempotent() {
    let conn = MockConnection::new("prepare-idempotent");
    let mut cmd = text_command(&conn, "SELECT @x");
    cmd.parameters_mut().add(int_param("x", 1));

    cmd.prepare().unwrap();
    cmd.prepare().unwrap();

    conn.parser.push_script(prepexec_scalar_script(3, 1));
    cmd.execute_scalar().await.unwrap();

    // Two prepares without an intervening mutation produce one
    // prepare-execute on the wire.
    let writes = conn.parser.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].proc_name(), "sp_prepexec");

    // And a prepared, clean command stays prepared.
    cmd.prepare().unwrap();
    conn.parser.push_script(scalar_script(1));
    cmd.execute_scalar().await.unwrap();
    assert_eq!(conn.parser.writes()[1].proc_name(), "sp_execute");
}

#[tokio::test]
async fn text_without_parameters_goes_as_raw_batch() {
    let conn = MockConnection::new("raw-batch");
    let mut cmd = text_command(&conn, "DELETE FROM t");
    conn.parser.push_script(vec![done(3)]);

    let rows = cmd.execute_non_query().await.unwrap();
    assert_eq!(rows, 3);

    let writes = conn.parser.writes();
    assert!(matches!(&writes[0], Write::Batch { text, .. } if text == "DELETE FROM t"));
}

#[tokio::test]
async fn unprepared_text_with_parameters_uses_execute_sql() {
    let conn = MockConnection::new("executesql");
    let mut cmd = text_command(&conn, "SELECT @x");
    cmd.parameters_mut().add(int_param("x", 9));
    conn.parser.push_script(scalar_script(9));

    assert_eq!(cmd.execute_scalar().await.unwrap(), Some(SqlValue::Int(9)));
    assert_eq!(conn.parser.writes()[0].proc_name(), "sp_executesql");
    assert_eq!(cmd.prepare_state(), PrepareState::Unprepared);
}

#[tokio::test]
async fn return_status_binds_to_return_value_parameter() {
    let conn = MockConnection::new("return-status");
    let mut cmd = proc_command(&conn, "dbo.returns_seven");
    cmd.parameters_mut().add(
        SqlParameter::new("ret", TdsType::Int).with_direction(ParamDirection::ReturnValue),
    );

    conn.parser
        .push_script(vec![TokenEvent::ReturnStatus(7), done(0)]);
    cmd.execute_non_query().await.unwrap();

    assert_eq!(
        cmd.parameters().by_name("ret").unwrap().value().as_i32(),
        Some(7)
    );
    let writes = conn.parser.writes();
    assert_eq!(writes[0].proc_name(), "dbo.returns_seven");
    assert!(matches!(&writes[0], Write::Rpc { is_proc: true, .. }));
}

#[tokio::test]
async fn overlong_procedure_name_fails_at_rpc_build() {
    let conn = MockConnection::new("name-cap");
    // 524 UTF-16 units is one past the 1046-byte cap.
    let mut cmd = proc_command(&conn, &"p".repeat(524));

    let err = cmd.execute_non_query().await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgumentLength {
            chars: 524,
            max: 523,
            ..
        }
    ));
    assert!(conn.balanced());
}

#[tokio::test]
async fn output_parameter_binds_by_name() {
    let conn = MockConnection::new("output-bind");
    let mut cmd = proc_command(&conn, "dbo.totals");
    cmd.parameters_mut().add(
        SqlParameter::new("total", TdsType::Int).with_direction(ParamDirection::Output),
    );

    conn.parser.push_script(vec![
        TokenEvent::ReturnValue(mssql_command::ReturnValueRecord {
            name: "@total".to_string(),
            ty: TdsType::Int,
            precision: 0,
            scale: 0,
            value: SqlValue::Int(55),
        }),
        done(1),
    ]);
    cmd.execute_non_query().await.unwrap();

    assert_eq!(
        cmd.parameters().by_name("total").unwrap().value().as_i32(),
        Some(55)
    );
}

#[tokio::test]
async fn udt_output_goes_through_the_connection_factory() {
    let conn = MockConnection::new("udt-factory");
    let mut cmd = proc_command(&conn, "dbo.geo");
    cmd.parameters_mut().add(
        SqlParameter::new("shape", TdsType::Udt)
            .with_type_name("dbo.Point")
            .with_direction(ParamDirection::Output),
    );

    conn.parser.push_script(vec![
        TokenEvent::ReturnValue(mssql_command::ReturnValueRecord {
            name: "@shape".to_string(),
            ty: TdsType::Udt,
            precision: 0,
            scale: 0,
            value: SqlValue::Binary(bytes::Bytes::from_static(&[7, 7, 7])),
        }),
        done(0),
    ]);
    cmd.execute_non_query().await.unwrap();

    assert_eq!(
        cmd.parameters().by_name("shape").unwrap().value().as_str(),
        Some("udt:dbo.Point:3")
    );
}

#[tokio::test]
async fn xml_reader_concatenates_fragments() {
    let conn = MockConnection::new("xml");
    let mut cmd = text_command(&conn, "SELECT doc FROM t FOR XML AUTO");
    conn.parser.push_script(vec![
        result_set(&["XML_F52E2B61-18A1-11d1-B105-00805F49916B"]),
        TokenEvent::Row(vec![SqlValue::String("<root>".to_string())]),
        TokenEvent::Row(vec![SqlValue::String("</root>".to_string())]),
        done(0),
    ]);

    let doc = cmd.execute_xml_reader().await.unwrap();
    assert_eq!(doc, "<root></root>");
}

#[tokio::test]
async fn reader_streams_rows_and_returns_session() {
    let conn = MockConnection::new("reader");
    let mut cmd = text_command(&conn, "SELECT n FROM t");
    conn.parser.push_script(vec![
        result_set(&["n"]),
        TokenEvent::Row(vec![SqlValue::Int(1)]),
        TokenEvent::Row(vec![SqlValue::Int(2)]),
        done(0),
    ]);

    let mut reader = cmd.execute_reader().await.unwrap();
    assert_eq!(reader.columns(), ["n".to_string()]);
    assert_eq!(reader.next_row().await.unwrap(), Some(vec![SqlValue::Int(1)]));
    assert_eq!(reader.next_row().await.unwrap(), Some(vec![SqlValue::Int(2)]));
    assert_eq!(reader.next_row().await.unwrap(), None);

    // The session stays borrowed until the reader closes.
    assert!(!conn.balanced());
    let outcome = reader.close().await.unwrap();
    assert_eq!(outcome.rows_affected, 0);
    assert!(conn.balanced());
}

#[tokio::test]
async fn batch_accounts_per_rpc() {
    let conn = MockConnection::new("batch");
    let mut cmd = text_command(&conn, "ignored");

    let mut first = ParameterCollection::new();
    first.add(int_param("a", 1));
    cmd.add_batch_command("UPDATE t SET x = @a", CommandKind::TextBatch, first)
        .unwrap();
    cmd.add_batch_command(
        "DELETE FROM u",
        CommandKind::TextBatch,
        ParameterCollection::new(),
    )
    .unwrap();

    conn.parser.push_script(vec![done(2)]);
    conn.parser.push_script(vec![done(3)]);

    let total = cmd.execute_non_query().await.unwrap();
    assert_eq!(total, 5);

    let batch = cmd.batch().unwrap();
    assert_eq!(batch.rows_affected(0), Some(2));
    assert_eq!(batch.rows_affected(1), Some(3));
    assert_eq!(batch.cumulative_rows_affected(1), Some(5));
    assert!(conn.balanced());
}

#[tokio::test]
async fn batch_error_slices_reconstruct_faults() {
    let conn = MockConnection::new("batch-errors");
    let mut cmd = text_command(&conn, "ignored");
    cmd.add_batch_command(
        "UPDATE a SET x = 1",
        CommandKind::TextBatch,
        ParameterCollection::new(),
    )
    .unwrap();
    cmd.add_batch_command(
        "UPDATE b SET x = 1",
        CommandKind::TextBatch,
        ParameterCollection::new(),
    )
    .unwrap();

    conn.parser.push_script(vec![done(1)]);
    conn.parser.push_script(vec![server_error(547), done(0)]);

    let err = cmd.execute_non_query().await.unwrap_err();
    assert!(err.is_server_error(547));

    let batch = cmd.batch().unwrap();
    assert!(batch.get_errors(0).is_empty());
    let faults = batch.get_errors(1);
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].number, 547);
    assert!(conn.balanced());
}

#[tokio::test]
async fn server_error_surfaces_with_details() {
    let conn = MockConnection::new("server-error");
    let mut cmd = text_command(&conn, "SELECT 1/0");
    conn.parser.push_script(vec![server_error(8134), done(0)]);

    let err = cmd.execute_scalar().await.unwrap_err();
    match err {
        Error::Server {
            number, message, ..
        } => {
            assert_eq!(number, 8134);
            assert!(message.contains("8134"));
        }
        other => panic!("expected a server error, got {other:?}"),
    }
    assert!(conn.balanced());
}
