// RestKit
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.


//! REST interface of the service.

use crate::model::{Note, NoteDto, Project};
use crate::store::{PROJECT_PARAM, Store, project_from_context};
use log::info;
use restkit_core::context::Context;
use restkit_http::ids::{IdAccessor, IdConverter};
use restkit_http::mapping::DtoMapping;
use restkit_http::service::middleware;
use restkit_http::{
    BoxedHandler, Handler, Middleware, Request, RestError, RestHandler, RestHandlerOptions,
    Router, handler_fn,
};
use std::sync::Arc;
use uuid::Uuid;

/// Path under which projects are served.
pub const PROJECTS_PATH: &str = "/api/v1/projects";

/// Returns the mapping between notes and their wire representation.
///
/// The owning project is taken from the `project_id` path parameter of the context.
pub fn note_mapping() -> DtoMapping<Note, NoteDto> {
    DtoMapping::new(
        |_ctx: &Context, note: Note| Ok(note.into_dto()),
        |ctx: &Context, dto: NoteDto| {
            let project = project_from_context(ctx).map_err(|e| e.to_string())?;
            Note::from_dto(project, dto).map_err(|e| e.to_string())
        },
    )
}

/// Returns the accessor for the identifiers of notes.
pub fn note_id_accessor() -> IdAccessor<Note, Uuid> {
    IdAccessor::new(
        |note: &Note| note.id,
        |note: &mut Note, id| {
            note.id = Some(id);
            Ok(())
        },
    )
}

/// Creates a middleware that logs every request along with its response status.
fn log_requests() -> Middleware {
    middleware(|next: BoxedHandler| -> BoxedHandler {
        Arc::new(handler_fn(move |request: Request| {
            let next = next.clone();
            async move {
                let method = request.method().clone();
                let path = request.uri().path().to_owned();
                let response = next.call(request).await;
                info!("{} {} -> {}", method, path, response.status());
                response
            }
        }))
    })
}

/// Creates the router for the service backed by `store`.
pub fn app(store: Store, opts: RestHandlerOptions) -> Router {
    let notes = RestHandler::<Note, Uuid>::with_mapping(note_mapping(), note_id_accessor())
        .with_id_converter(IdConverter::from_str_display())
        .with_crud(store.notes())
        .with_options(opts.clone());
    let project_routes = Router::new();
    project_routes.resource("/notes", notes);

    let projects_repo = store.projects();
    let projects = RestHandler::<Project, Uuid>::new()
        .with_id_converter(IdConverter::from_str_display())
        .with_id_path_param(PROJECT_PARAM)
        .with_resource_context(move |ctx: Context, id: Uuid| {
            let store = store.clone();
            async move {
                if store.has_project(&id).await {
                    Ok(ctx)
                } else {
                    Err(RestError::EntityNotFound(format!("Project {} not found", id)))
                }
            }
        })
        .with_crud(projects_repo)
        .with_resource_routes(project_routes)
        .with_options(opts);

    let router = Router::new();
    router.use_middleware([log_requests()]);
    router.resource(PROJECTS_PATH, projects);
    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};
    use restkit_http::testutils::*;
    use serde_json::json;

    fn new_app() -> Router {
        app(Store::default(), RestHandlerOptions::default())
    }

    async fn create_project(app: &Router, name: &str) -> Project {
        OneShotBuilder::new(app.clone(), (Method::POST, PROJECTS_PATH))
            .send_json(json!({"name": name}))
            .await
            .expect_status(StatusCode::CREATED)
            .expect_json::<Project>()
            .await
    }

    #[tokio::test]
    async fn test_projects() {
        let app = new_app();
        let first = create_project(&app, "first").await;
        let second = create_project(&app, "second").await;

        let all: Vec<Project> = OneShotBuilder::new(app.clone(), (Method::GET, PROJECTS_PATH))
            .send_empty()
            .await
            .expect_list()
            .await;
        assert_eq!(vec![first.clone(), second], all);

        let path = format!("{}/{}", PROJECTS_PATH, first.id.unwrap());
        OneShotBuilder::new(app.clone(), (Method::PUT, &path))
            .send_json(json!({"name": "renamed"}))
            .await
            .expect_status(StatusCode::NO_CONTENT)
            .expect_empty()
            .await;

        let shown: Project = OneShotBuilder::new(app, (Method::GET, &path))
            .send_empty()
            .await
            .expect_json()
            .await;
        assert_eq!(Project { id: first.id, name: "renamed".to_owned() }, shown);
    }

    #[tokio::test]
    async fn test_project_validation() {
        OneShotBuilder::new(new_app(), (Method::POST, PROJECTS_PATH))
            .send_json(json!({"name": ""}))
            .await
            .expect_status(StatusCode::BAD_REQUEST)
            .expect_problem("invalid-request-body")
            .await;
    }

    #[tokio::test]
    async fn test_malformed_project_id() {
        let problem = OneShotBuilder::new(new_app(), (Method::GET, "/api/v1/projects/not-a-uuid"))
            .send_empty()
            .await
            .expect_status(StatusCode::BAD_REQUEST)
            .expect_problem("malformed-id-in-path")
            .await;
        assert_eq!("/api/v1/projects/not-a-uuid", problem.instance);
    }

    #[tokio::test]
    async fn test_notes() {
        let app = new_app();
        let project = create_project(&app, "p").await;
        let path = format!("{}/{}/notes", PROJECTS_PATH, project.id.unwrap());

        let created: NoteDto = OneShotBuilder::new(app.clone(), (Method::POST, &path))
            .send_json(json!({"text": "hello"}))
            .await
            .expect_status(StatusCode::CREATED)
            .expect_json()
            .await;
        assert_eq!("hello", created.text);

        let notes: Vec<NoteDto> = OneShotBuilder::new(app.clone(), (Method::GET, &path))
            .send_empty()
            .await
            .expect_list()
            .await;
        assert_eq!(vec![created], notes);

        OneShotBuilder::new(app, (Method::DELETE, &path))
            .send_empty()
            .await
            .expect_status(StatusCode::METHOD_NOT_ALLOWED)
            .expect_problem("rest-method-not-allowed")
            .await;
    }

    #[tokio::test]
    async fn test_notes_of_unknown_project() {
        let path = format!("{}/{}/notes", PROJECTS_PATH, Uuid::new_v4());
        OneShotBuilder::new(new_app(), (Method::GET, &path))
            .send_empty()
            .await
            .expect_status(StatusCode::NOT_FOUND)
            .expect_problem("entity-not-found")
            .await;
    }

    #[tokio::test]
    async fn test_deleting_project_deletes_notes() {
        let app = new_app();
        let project = create_project(&app, "p").await;
        let project_path = format!("{}/{}", PROJECTS_PATH, project.id.unwrap());
        let notes_path = format!("{}/notes", project_path);

        OneShotBuilder::new(app.clone(), (Method::POST, &notes_path))
            .send_json(json!({"text": "hello"}))
            .await
            .expect_status(StatusCode::CREATED)
            .expect_json::<NoteDto>()
            .await;

        OneShotBuilder::new(app.clone(), (Method::DELETE, &project_path))
            .send_empty()
            .await
            .expect_status(StatusCode::NO_CONTENT)
            .expect_empty()
            .await;

        OneShotBuilder::new(app, (Method::GET, &notes_path))
            .send_empty()
            .await
            .expect_status(StatusCode::NOT_FOUND)
            .expect_problem("entity-not-found")
            .await;
    }
}
