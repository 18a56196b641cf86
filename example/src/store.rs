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


//! In-memory persistence for projects and their notes.

use crate::model::{Note, Project};
use async_trait::async_trait;
use futures::lock::Mutex;
use futures::stream::{self, StreamExt};
use log::debug;
use restkit_core::context::Context;
use restkit_core::crud::{
    AllDeleter, AllFinder, ByIdDeleter, ByIdFinder, Creator, CrudCapabilities, CrudError,
    CrudResult, EntityStream, Updater,
};
use std::sync::Arc;
use uuid::Uuid;

/// Name of the path parameter that carries the identifier of the project that owns notes.
pub const PROJECT_PARAM: &str = "project_id";

/// Contents of the store.
#[derive(Default)]
struct Tables {
    /// All projects in creation order.
    projects: Vec<Project>,

    /// All notes in creation order.
    notes: Vec<Note>,
}

/// Shared storage for all entities of the service.
#[derive(Clone, Default)]
pub struct Store {
    /// The stored entities.
    tables: Arc<Mutex<Tables>>,
}

impl Store {
    /// Returns true if the project `id` exists.
    pub async fn has_project(&self, id: &Uuid) -> bool {
        self.tables.lock().await.projects.iter().any(|p| p.id.as_ref() == Some(id))
    }

    /// Returns the repository of projects.
    pub fn projects(&self) -> Arc<Projects> {
        Arc::new(Projects(self.clone()))
    }

    /// Returns the repository of notes, scoped by the project named in the context.
    pub fn notes(&self) -> Arc<Notes> {
        Arc::new(Notes(self.clone()))
    }
}

/// Extracts the project that owns the notes of a request from `ctx`.
pub fn project_from_context(ctx: &Context) -> CrudResult<Uuid> {
    let raw = ctx
        .path_param(PROJECT_PARAM)
        .ok_or_else(|| CrudError::InvalidInput("Notes require a project".to_owned()))?;
    Uuid::parse_str(raw).map_err(|e| CrudError::InvalidInput(format!("Invalid project '{}': {}", raw, e)))
}

/// Repository of projects.
pub struct Projects(Store);

#[async_trait]
impl Creator<Project> for Projects {
    async fn create(&self, _ctx: &Context, mut project: Project) -> CrudResult<Project> {
        project.validate().map_err(|e| CrudError::InvalidInput(e.0))?;

        let mut tables = self.0.tables.lock().await;
        match project.id {
            Some(id) => {
                if tables.projects.iter().any(|p| p.id == Some(id)) {
                    return Err(CrudError::AlreadyExists(format!("Project {} already exists", id)));
                }
            }
            None => project.id = Some(Uuid::new_v4()),
        }
        debug!("Creating project {:?}", project.id);
        tables.projects.push(project.clone());
        Ok(project)
    }
}

impl AllFinder<Project> for Projects {
    fn find_all(&self, _ctx: &Context) -> EntityStream<Project> {
        let tables = self.0.tables.clone();
        stream::once(async move { tables.lock().await.projects.clone() })
            .flat_map(|projects| stream::iter(projects.into_iter().map(Ok)))
            .boxed()
    }
}

#[async_trait]
impl ByIdFinder<Project, Uuid> for Projects {
    async fn find_by_id(&self, _ctx: &Context, id: &Uuid) -> CrudResult<Option<Project>> {
        let tables = self.0.tables.lock().await;
        Ok(tables.projects.iter().find(|p| p.id.as_ref() == Some(id)).cloned())
    }
}

#[async_trait]
impl Updater<Project> for Projects {
    async fn update(&self, _ctx: &Context, project: Project) -> CrudResult<()> {
        project.validate().map_err(|e| CrudError::InvalidInput(e.0))?;

        let mut tables = self.0.tables.lock().await;
        match tables.projects.iter_mut().find(|p| p.id.is_some() && p.id == project.id) {
            Some(slot) => {
                *slot = project;
                Ok(())
            }
            None => Err(CrudError::NotFound("Project not found".to_owned())),
        }
    }
}

#[async_trait]
impl ByIdDeleter<Uuid> for Projects {
    async fn delete_by_id(&self, _ctx: &Context, id: &Uuid) -> CrudResult<()> {
        let mut tables = self.0.tables.lock().await;
        let before = tables.projects.len();
        tables.projects.retain(|p| p.id.as_ref() != Some(id));
        if tables.projects.len() == before {
            return Err(CrudError::NotFound("Project not found".to_owned()));
        }
        tables.notes.retain(|n| n.project != *id);
        Ok(())
    }
}

#[async_trait]
impl AllDeleter for Projects {
    async fn delete_all(&self, _ctx: &Context) -> CrudResult<()> {
        let mut tables = self.0.tables.lock().await;
        tables.projects.clear();
        tables.notes.clear();
        Ok(())
    }
}

impl CrudCapabilities<Project, Uuid> for Projects {
    fn creator(self: Arc<Self>) -> Option<Arc<dyn Creator<Project>>> {
        Some(self)
    }

    fn all_finder(self: Arc<Self>) -> Option<Arc<dyn AllFinder<Project>>> {
        Some(self)
    }

    fn by_id_finder(self: Arc<Self>) -> Option<Arc<dyn ByIdFinder<Project, Uuid>>> {
        Some(self)
    }

    fn updater(self: Arc<Self>) -> Option<Arc<dyn Updater<Project>>> {
        Some(self)
    }

    fn by_id_deleter(self: Arc<Self>) -> Option<Arc<dyn ByIdDeleter<Uuid>>> {
        Some(self)
    }

    fn all_deleter(self: Arc<Self>) -> Option<Arc<dyn AllDeleter>> {
        Some(self)
    }
}

/// Repository of the notes of the project named in the context of each operation.
///
/// Notes cannot be deleted in bulk.
pub struct Notes(Store);

#[async_trait]
impl Creator<Note> for Notes {
    async fn create(&self, ctx: &Context, mut note: Note) -> CrudResult<Note> {
        let project = project_from_context(ctx)?;
        if note.project != project {
            return Err(CrudError::InvalidInput("Note belongs to another project".to_owned()));
        }

        let mut tables = self.0.tables.lock().await;
        if !tables.projects.iter().any(|p| p.id == Some(project)) {
            return Err(CrudError::NotFound(format!("Project {} not found", project)));
        }
        match note.id {
            Some(id) => {
                if tables.notes.iter().any(|n| n.id == Some(id)) {
                    return Err(CrudError::AlreadyExists(format!("Note {} already exists", id)));
                }
            }
            None => note.id = Some(Uuid::new_v4()),
        }
        tables.notes.push(note.clone());
        Ok(note)
    }
}

impl AllFinder<Note> for Notes {
    fn find_all(&self, ctx: &Context) -> EntityStream<Note> {
        let project = match project_from_context(ctx) {
            Ok(project) => project,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let tables = self.0.tables.clone();
        stream::once(async move {
            let tables = tables.lock().await;
            tables.notes.iter().filter(|n| n.project == project).cloned().collect::<Vec<Note>>()
        })
        .flat_map(|notes| stream::iter(notes.into_iter().map(Ok)))
        .boxed()
    }
}

#[async_trait]
impl ByIdFinder<Note, Uuid> for Notes {
    async fn find_by_id(&self, ctx: &Context, id: &Uuid) -> CrudResult<Option<Note>> {
        let project = project_from_context(ctx)?;
        let tables = self.0.tables.lock().await;
        Ok(tables.notes.iter().find(|n| n.project == project && n.id.as_ref() == Some(id)).cloned())
    }
}

#[async_trait]
impl Updater<Note> for Notes {
    async fn update(&self, ctx: &Context, note: Note) -> CrudResult<()> {
        let project = project_from_context(ctx)?;
        let mut tables = self.0.tables.lock().await;
        let slot = tables
            .notes
            .iter_mut()
            .find(|n| n.project == project && n.id.is_some() && n.id == note.id);
        match slot {
            Some(slot) => {
                *slot = note;
                Ok(())
            }
            None => Err(CrudError::NotFound("Note not found".to_owned())),
        }
    }
}

#[async_trait]
impl ByIdDeleter<Uuid> for Notes {
    async fn delete_by_id(&self, ctx: &Context, id: &Uuid) -> CrudResult<()> {
        let project = project_from_context(ctx)?;
        let mut tables = self.0.tables.lock().await;
        let before = tables.notes.len();
        tables.notes.retain(|n| !(n.project == project && n.id.as_ref() == Some(id)));
        if tables.notes.len() == before {
            return Err(CrudError::NotFound("Note not found".to_owned()));
        }
        Ok(())
    }
}

impl CrudCapabilities<Note, Uuid> for Notes {
    fn creator(self: Arc<Self>) -> Option<Arc<dyn Creator<Note>>> {
        Some(self)
    }

    fn all_finder(self: Arc<Self>) -> Option<Arc<dyn AllFinder<Note>>> {
        Some(self)
    }

    fn by_id_finder(self: Arc<Self>) -> Option<Arc<dyn ByIdFinder<Note, Uuid>>> {
        Some(self)
    }

    fn updater(self: Arc<Self>) -> Option<Arc<dyn Updater<Note>>> {
        Some(self)
    }

    fn by_id_deleter(self: Arc<Self>) -> Option<Arc<dyn ByIdDeleter<Uuid>>> {
        Some(self)
    }
}
