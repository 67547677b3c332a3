use actix_web::{App, HttpServer, middleware, web};
use box_server::app_state::AppState;
use box_server::{box_controller, incoming_controller, outgoing_controller, supervisor};
use common::server_config;
use common::storage::StorageService;
use common::utils::setup_logging;
use database::dbprovider;
use slog::{error, info};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let log = setup_logging("box-server");

    let config = match server_config::load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(log, "Error loading config: {}", e);
            return Err(std::io::Error::other(e));
        }
    };

    let server_config = config.server.clone().ok_or_else(|| {
        error!(log, "server config is none");
        std::io::Error::other("server config is none")
    })?;
    let storage_config = config.local_storage.clone().ok_or_else(|| {
        error!(log, "local_storage config is none");
        std::io::Error::other("local_storage config is none")
    })?;
    let box_config = config.box_transfer.clone().unwrap_or_default();

    let database_url = server_config::generate_database_connection(&config)
        .map_err(std::io::Error::other)?;
    let pool = dbprovider::connect_pool(&database_url)
        .await
        .map_err(std::io::Error::other)?;
    dbprovider::create_all_tables(&pool)
        .await
        .map_err(std::io::Error::other)?;

    let storage = StorageService::new(storage_config.dicom_store_path.clone());
    storage.ensure_base().await.map_err(std::io::Error::other)?;

    let state = AppState::new(
        log.clone(),
        pool,
        storage,
        box_config,
        server_config.name.clone(),
    );

    supervisor::start(state.clone());

    info!(
        log,
        "Box server {} listening on {}:{}", state.node_name, server_config.host, server_config.port
    );

    let app_state = state.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::Logger::default())
            .service(incoming_controller::receive_pushed_image)
            .service(outgoing_controller::poll_outgoing)
            .service(outgoing_controller::fetch_outgoing_image)
            .service(outgoing_controller::outgoing_done)
            .service(outgoing_controller::outgoing_failed)
            .service(box_controller::create_push_box)
            .service(box_controller::create_poll_box)
            .service(box_controller::list_boxes)
            .service(box_controller::delete_box)
            .service(box_controller::send_images_to_box)
            .service(box_controller::list_outgoing_transactions)
            .service(box_controller::list_incoming_transactions)
    })
    .bind((server_config.host.as_str(), server_config.port))?
    .run()
    .await
}
