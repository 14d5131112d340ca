use crate::db::DatabaseService;
use crate::document::TIMESTAMP_FORMAT;
use crate::models::ReadingDocument;
use chrono::{NaiveDate, NaiveDateTime};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Status;
use rocket::serde::{json::Json, Serialize};
use rocket::{get, routes, State};
use std::sync::Arc;
use tracing::error;

const DEFAULT_LIMIT: usize = 100;

/// API Response
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ApiResponse {
    status: String,
    message: String,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct StatusResponse {
    status: String,
    total_documents: i64,
    latest_document: Option<ReadingDocument>,
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Methods",
            "GET",
        ));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type",
        ));
    }
}

/// `start`/`end` query params accept a full timestamp or a bare date.
fn parse_date(date_str: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(date_str, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(date_str, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Latest readings across all sensors, newest first.
#[get("/api/readings?<limit>")]
fn all_readings(
    limit: Option<usize>,
    db: &State<Arc<DatabaseService>>,
) -> Result<Json<Vec<ReadingDocument>>, Status> {
    match db.get_recent_readings(limit.unwrap_or(DEFAULT_LIMIT)) {
        Ok(docs) => Ok(Json(docs)),
        Err(_) => Err(Status::InternalServerError),
    }
}

/// The newest reading for one sensor.
#[get("/api/readings/latest/<sensor_id>")]
fn latest_reading(
    sensor_id: String,
    db: &State<Arc<DatabaseService>>,
) -> Result<Json<ReadingDocument>, Status> {
    match db.get_latest_reading(&sensor_id) {
        Ok(Some(doc)) => Ok(Json(doc)),
        Ok(None) => Err(Status::NotFound),
        Err(_) => Err(Status::InternalServerError),
    }
}

/// Readings for one sensor, optionally bounded by a date range.
#[get("/api/readings/<sensor_id>?<start>&<end>&<limit>")]
fn sensor_readings(
    sensor_id: String,
    start: Option<String>,
    end: Option<String>,
    limit: Option<usize>,
    db: &State<Arc<DatabaseService>>,
) -> Result<Json<Vec<ReadingDocument>>, Status> {
    let start = start.as_deref().and_then(parse_date);
    let end = end.as_deref().and_then(parse_date);

    match db.get_readings(&sensor_id, start, end, limit.unwrap_or(DEFAULT_LIMIT)) {
        Ok(docs) => Ok(Json(docs)),
        Err(_) => Err(Status::InternalServerError),
    }
}

/// Connectivity check: document count plus the latest document.
#[get("/api/test")]
fn test_connection(db: &State<Arc<DatabaseService>>) -> Result<Json<StatusResponse>, Status> {
    let count = db.count_readings().map_err(|_| Status::InternalServerError)?;
    let latest = db
        .get_recent_readings(1)
        .map_err(|_| Status::InternalServerError)?
        .into_iter()
        .next();

    Ok(Json(StatusResponse {
        status: "connected".to_string(),
        total_documents: count,
        latest_document: latest,
    }))
}

/// Root handler
#[get("/")]
fn root_handler() -> Json<ApiResponse> {
    Json(ApiResponse {
        status: "success".to_string(),
        message: "SensorFlux query API".to_string(),
    })
}

/// Run the Rocket server with the provided DatabaseService
pub async fn run_rest_server(db_service: Arc<DatabaseService>) {
    let result = rocket::build()
        .manage(db_service)
        .mount(
            "/",
            routes![
                root_handler,
                all_readings,
                latest_reading,
                sensor_readings,
                test_connection
            ],
        )
        .attach(Cors)
        .launch()
        .await;

    if let Err(e) = result {
        error!("REST server exited with error: {e}");
    }
}
