use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::evaluator::Evaluator;
use crate::routes::{json_error_handler, post_evaluate_handler};

/// JSON extractor settings for `/evaluate`, accepting bodies up to `limit` bytes
pub fn json_config(limit: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(json_error_handler)
}

pub fn build_server(
    server_config: ServerConfig,
    evaluator: web::Data<Evaluator>,
) -> std::io::Result<Server> {
    let bind_address = server_config.bind_address();
    let bind_port = server_config.bind_port();
    let max_body_bytes = server_config.max_body_bytes();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(evaluator.clone())
            .app_data(json_config(max_body_bytes))
            .wrap(middleware::Logger::default())
            .service(post_evaluate_handler)
    })
    .disable_signals()
    .bind((bind_address.as_str(), bind_port))?
    .run();

    log::info!("Listening on {bind_address}:{bind_port}");
    Ok(server)
}
