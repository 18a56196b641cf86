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


//! Entry point to the sample service.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use log::info;
use restkit_core::env::get_optional_var;
use restkit_example::serve;
use restkit_example::store::Store;
use restkit_http::RestHandlerOptions;
use std::error::Error;
use std::net::Ipv4Addr;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let port = get_optional_var::<u16>("EXAMPLE", "PORT")?.unwrap_or(3000);
    let opts = RestHandlerOptions::from_env("EXAMPLE")?;

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    serve(listener, Store::default(), opts).await?;
    Ok(())
}
