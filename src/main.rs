use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use clap::Parser;
use operator::{self, config::Settings, init_controller::{run, State}, telemetry};

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    telemetry::init(settings.log_format);

    // Initiatilize Kubernetes controller state
    let state = State::default();
    let listen = settings.listen.clone();
    let controller = run(settings, state.clone());
    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
    })
    .bind(listen)?
    .shutdown_timeout(5)
    .run();
    let server_handle = server.handle();

    // The controller returns on shutdown or on a startup failure; either way stop serving
    let (controller_result, server_result) = tokio::join!(
        async {
            let res = controller.await;
            server_handle.stop(true).await;
            res
        },
        server
    );
    controller_result?;
    server_result?;
    Ok(())
}
