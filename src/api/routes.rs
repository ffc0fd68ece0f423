use actix_web::web;

use super::handlers;

/// Wire the core's exposed operations under `/api`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/patients", web::post().to(handlers::register_patient))
            .route("/patients", web::get().to(handlers::list_patients))
            .route("/queue", web::get().to(handlers::queue_board))
            .route("/queue/add", web::post().to(handlers::add_to_queue))
            .route(
                "/consultations/start",
                web::post().to(handlers::start_consultation),
            )
            .route(
                "/consultations/complete",
                web::post().to(handlers::complete_consultation),
            )
            .route("/lab-results", web::post().to(handlers::ingest_lab_result))
            .route("/lab-results", web::get().to(handlers::list_lab_results))
            .route(
                "/lab-results/{id}/acknowledge",
                web::post().to(handlers::acknowledge_result),
            )
            .route(
                "/lab-results/{id}/viewed",
                web::post().to(handlers::mark_viewed),
            )
            .route("/alerts", web::get().to(handlers::unacknowledged_alerts)),
    );
}
