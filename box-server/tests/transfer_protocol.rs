use actix_web::{App, test, web};
use box_server::app_state::AppState;
use box_server::{incoming_controller, outgoing_controller};
use common::server_config::BoxTransferConfig;
use common::storage::StorageService;
use database::dbprovider;
use database::transfer_meta::{
    BoxEntity, BoxSendMethod, FailedOutgoingTransaction, OutgoingTransactionImage,
    TransactionStatus,
};
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_streams::anonymization::AnonymizationContext;
use dicom_streams::parts::EXPLICIT_VR_LITTLE_ENDIAN;
use dicom_streams::pipeline::{anonymize_dicom_data, collect_identifiers};

fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

fn test_object_bytes(sop_class: &str, sop_instance: &str) -> Vec<u8> {
    let mut obj = InMemDicomObject::new_empty();
    put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, sop_class);
    put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop_instance);
    put_str(&mut obj, tags::MODALITY, VR::CS, "CT");
    put_str(&mut obj, tags::PATIENT_NAME, VR::PN, "DOE^JOHN");
    put_str(&mut obj, tags::PATIENT_ID, VR::LO, "PID42");
    put_str(&mut obj, tags::PATIENT_BIRTH_DATE, VR::DA, "19700101");
    put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3.4");
    put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.4.1");

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class)
        .media_storage_sop_instance_uid(sop_instance)
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
        .build()
        .expect("failed to build file meta");
    let file_obj = obj.with_exact_meta(meta);

    let mut bytes = Vec::new();
    file_obj.write_all(&mut bytes).expect("failed to write test object");
    bytes
}

fn anonymized_object_bytes(sop_instance: &str) -> Vec<u8> {
    let original = test_object_bytes(uids::CT_IMAGE_STORAGE, sop_instance);
    let info = collect_identifiers(&original).unwrap();
    let ctx = AnonymizationContext::fresh(&info);
    anonymize_dicom_data(&original, ctx, vec![]).unwrap()
}

async fn test_state() -> (AppState, tempfile::TempDir) {
    let pool = dbprovider::connect_pool("sqlite::memory:").await.unwrap();
    dbprovider::create_all_tables(&pool).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let storage = StorageService::new(dir.path());
    storage.ensure_base().await.unwrap();

    let log = slog::Logger::root(slog::Discard, slog::o!());
    let state = AppState::new(
        log,
        pool,
        storage,
        BoxTransferConfig::default(),
        "test-node".to_string(),
    );
    (state, dir)
}

async fn push_box(state: &AppState, name: &str, token: &str) -> BoxEntity {
    state
        .transfer
        .insert_box(name, token, "http://remote/api", BoxSendMethod::Push)
        .await
        .unwrap()
}

#[actix_web::test]
async fn test_incoming_push_is_idempotent() {
    let (state, _dir) = test_state().await;
    let sender = push_box(&state, "peer-a", "token-a").await;
    let data = anonymized_object_bytes("1.9.1");

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(incoming_controller::receive_pushed_image),
    )
    .await;

    let uri = "/incoming?transactionid=7&sequencenumber=1&totalimagecount=1&token=token-a";
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri(uri).set_payload(data.clone()).to_request(),
    )
    .await;
    assert!(resp.status().is_success());

    let first = state
        .transfer
        .incoming_transaction_by_key(sender.id, 7)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.received_image_count, 1);
    assert_eq!(first.added_image_count, 1);
    assert_eq!(first.status, TransactionStatus::Finished);

    let images = state.transfer.incoming_images_for_transaction(first.id).await.unwrap();
    assert_eq!(images.len(), 1);
    let stored_name = StorageService::image_name(images[0].image_id);
    assert!(state.storage.contains(&stored_name).await);

    // 重放同一张影像: 计数与影像指向都不变
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri(uri).set_payload(data).to_request(),
    )
    .await;
    assert!(resp.status().is_success());

    let replayed = state
        .transfer
        .incoming_transaction_by_key(sender.id, 7)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replayed.received_image_count, 1);
    assert_eq!(replayed.added_image_count, 1);
    let images_after = state.transfer.incoming_images_for_transaction(first.id).await.unwrap();
    assert_eq!(images_after.len(), 1);
    assert_eq!(images_after[0].image_id, images[0].image_id);
}

#[actix_web::test]
async fn test_incoming_rejects_unknown_token() {
    let (state, _dir) = test_state().await;
    push_box(&state, "peer-b", "token-b").await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(incoming_controller::receive_pushed_image),
    )
    .await;

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/incoming?transactionid=1&sequencenumber=1&totalimagecount=1&token=wrong")
            .set_payload(anonymized_object_bytes("1.9.2"))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
async fn test_incoming_rejects_unsupported_context() {
    let (state, _dir) = test_state().await;
    push_box(&state, "peer-c", "token-c").await;

    // SOP 类不在校验白名单里
    let data = test_object_bytes("1.2.999.1", "1.9.3");

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(incoming_controller::receive_pushed_image),
    )
    .await;

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/incoming?transactionid=1&sequencenumber=1&totalimagecount=1&token=token-c")
            .set_payload(data)
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn test_poll_protocol_with_duplicate_ack() {
    let (state, _dir) = test_state().await;
    let poller = state
        .transfer
        .insert_box("poller", "poll-token", "", BoxSendMethod::Poll)
        .await
        .unwrap();

    // 备好待发影像并入队
    let data = test_object_bytes(uids::CT_IMAGE_STORAGE, "1.9.4");
    state
        .storage
        .write_file(&StorageService::image_name(55), &data)
        .await
        .unwrap();
    state
        .transfer
        .insert_outgoing_transaction_with_images(poller.id, "poller", &[(55, vec![])], 1000)
        .await
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(outgoing_controller::poll_outgoing)
            .service(outgoing_controller::fetch_outgoing_image)
            .service(outgoing_controller::outgoing_done),
    )
    .await;

    // 轮询拿到工作单元
    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/outgoing/poll?token=poll-token").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let work: OutgoingTransactionImage = test::read_body_json(resp).await;
    assert_eq!(work.image.sequence_number, 1);

    // 取字节, 对象已经匿名化
    let uri = format!(
        "/outgoing?transactionid={}&imageid={}&token=poll-token",
        work.transaction.id, work.image.id
    );
    let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
    assert_eq!(resp.status(), 200);
    let body = test::read_body(resp).await;
    let info = collect_identifiers(&body).unwrap();
    assert!(info.identity_removed());
    assert_ne!(info.patient_name(), "DOE^JOHN");

    // ACK 两次, 计数只进一次
    for _ in 0..2 {
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/outgoing/done?token=poll-token")
                .set_json(&work)
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 204);
    }

    let transaction = state
        .transfer
        .outgoing_transaction_by_id(work.transaction.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transaction.sent_image_count, 1);
    assert_eq!(transaction.status, TransactionStatus::Finished);

    // 队列清空后轮询返回 204
    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/outgoing/poll?token=poll-token").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 204);
}

#[actix_web::test]
async fn test_failed_transaction_survives_late_ack_replay() {
    let (state, _dir) = test_state().await;
    let poller = state
        .transfer
        .insert_box("flaky-poller", "flaky-token", "", BoxSendMethod::Poll)
        .await
        .unwrap();

    state
        .transfer
        .insert_outgoing_transaction_with_images(
            poller.id,
            "flaky-poller",
            &[(61, vec![]), (62, vec![])],
            1000,
        )
        .await
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(outgoing_controller::poll_outgoing)
            .service(outgoing_controller::outgoing_done)
            .service(outgoing_controller::outgoing_failed),
    )
    .await;

    // 第一张确认送达, 传输进入 PROCESSING
    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/outgoing/poll?token=flaky-token").to_request(),
    )
    .await;
    let work: OutgoingTransactionImage = test::read_body_json(resp).await;
    assert_eq!(work.image.sequence_number, 1);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/outgoing/done?token=flaky-token")
            .set_json(&work)
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 204);

    // 第二张失败, 轮询端上报, 传输进入 FAILED
    let failure = FailedOutgoingTransaction {
        transaction_id: work.transaction.id,
        message: "validation failed".to_string(),
    };
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/outgoing/failed?token=flaky-token")
            .set_json(&failure)
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 204);

    // 第一张的确认重放迟到: FAILED 不会被拉回 PROCESSING
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/outgoing/done?token=flaky-token")
            .set_json(&work)
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 204);

    let transaction = state
        .transfer
        .outgoing_transaction_by_id(work.transaction.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transaction.status, TransactionStatus::Failed);
    assert_eq!(transaction.sent_image_count, 1);
}

#[actix_web::test]
async fn test_outgoing_roundtrip_restores_identity() {
    let (state, _dir) = test_state().await;
    let peer = state
        .transfer
        .insert_box("loopback", "loop-token", "", BoxSendMethod::Poll)
        .await
        .unwrap();

    let data = test_object_bytes(uids::CT_IMAGE_STORAGE, "1.9.5");
    state
        .storage
        .write_file(&StorageService::image_name(77), &data)
        .await
        .unwrap();
    state
        .transfer
        .insert_outgoing_transaction_with_images(peer.id, "loopback", &[(77, vec![])], 1000)
        .await
        .unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(outgoing_controller::poll_outgoing)
            .service(outgoing_controller::fetch_outgoing_image)
            .service(incoming_controller::receive_pushed_image),
    )
    .await;

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/outgoing/poll?token=loop-token").to_request(),
    )
    .await;
    let work: OutgoingTransactionImage = test::read_body_json(resp).await;

    let uri = format!(
        "/outgoing?transactionid={}&imageid={}&token=loop-token",
        work.transaction.id, work.image.id
    );
    let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
    let anonymized = test::read_body(resp).await;

    // 匿名化字节回到同一节点: 化名映射命中, 身份还原
    let incoming_uri = format!(
        "/incoming?transactionid={}&sequencenumber=1&totalimagecount=1&token=loop-token",
        work.transaction.id
    );
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri(&incoming_uri)
            .set_payload(anonymized.to_vec())
            .to_request(),
    )
    .await;
    assert!(resp.status().is_success());

    let incoming = state
        .transfer
        .incoming_transaction_by_key(peer.id, work.transaction.id)
        .await
        .unwrap()
        .unwrap();
    let images = state.transfer.incoming_images_for_transaction(incoming.id).await.unwrap();
    let stored = state
        .storage
        .read_file(&StorageService::image_name(images[0].image_id))
        .await
        .unwrap();
    let restored = collect_identifiers(&stored).unwrap();
    assert_eq!(restored.patient_name(), "DOE^JOHN");
    assert_eq!(restored.patient_id(), "PID42");
    assert_eq!(restored.study_instance_uid(), "1.2.3.4");
    assert_eq!(restored.string(tags::PATIENT_IDENTITY_REMOVED), Some("NO"));
}
