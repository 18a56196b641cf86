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


//! Sample service that exposes projects and their notes as REST resources.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use restkit_http::RestHandlerOptions;
use std::io;
use tokio::net::TcpListener;

pub mod model;
pub mod rest;
pub mod store;
use store::Store;

/// Serves the application backed by `store` on `listener` until the server fails.
pub async fn serve(listener: TcpListener, store: Store, opts: RestHandlerOptions) -> io::Result<()> {
    let app = rest::app(store, opts);
    axum::serve(listener, app.into_axum()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Note, Project};
    use crate::rest::{PROJECTS_PATH, note_id_accessor, note_mapping};
    use crate::store::PROJECT_PARAM;
    use futures::TryStreamExt;
    use restkit_core::context::Context;
    use restkit_http::ids::IdConverter;
    use restkit_http::transport::ReqwestTransport;
    use restkit_http::{ClientError, RestClient};
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    /// Starts the service on a random local port and returns its base URL.
    async fn start_server() -> String {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Store::default(), RestHandlerOptions::default()));
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_clients_over_network() {
        let base_url = start_server().await;
        let ctx = Context::background();

        let projects = RestClient::<Project, Uuid>::new(
            format!("{}{}", base_url, PROJECTS_PATH),
            ReqwestTransport::default(),
        )
        .with_id_converter(IdConverter::from_str_display());
        let project = projects
            .create(&ctx, Project { id: None, name: "remote".to_owned() })
            .await
            .unwrap();
        let project_id = project.id.unwrap();

        let notes = RestClient::<Note, Uuid>::with_mapping(
            format!("{}{}/:{}/notes", base_url, PROJECTS_PATH, PROJECT_PARAM),
            ReqwestTransport::default(),
            note_mapping(),
            note_id_accessor(),
        )
        .with_id_converter(IdConverter::from_str_display())
        .with_context(move |ctx| ctx.with_path_param(PROJECT_PARAM, project_id.to_string()));

        let note =
            notes.create(&ctx, Note { id: None, project: project_id, text: "hi".to_owned() }).await.unwrap();
        assert_eq!(project_id, note.project);
        assert_eq!(Some(note.clone()), notes.find_by_id(&ctx, &note.id.unwrap()).await.unwrap());

        let all: Vec<Note> = notes.find_all(&ctx).try_collect().await.unwrap();
        assert_eq!(vec![note.clone()], all);

        projects.delete_by_id(&ctx, &project_id).await.unwrap();
        assert_eq!(None, projects.find_by_id(&ctx, &project_id).await.unwrap());
        match notes.find_all(&ctx).try_collect::<Vec<Note>>().await {
            Err(ClientError::UnexpectedResponse { status, .. }) => assert_eq!(404, status.as_u16()),
            e => panic!("Unexpected result {:?}", e),
        }
    }
}
